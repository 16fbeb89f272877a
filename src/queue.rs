//! 队列类型与硬件队列选择
//!
//! 设备初始化时根据查询到的队列族能力选出三条主队列（图形、传输、计算），
//! 并为额外的图形队列预留一个池。传输与计算分别按以下优先级选择：
//!
//! 1. 专用队列族（Dedicated）
//! 2. 与图形队列不同的、共享能力的队列（Shared）
//! 3. 直接复用图形队列（AliasedGraphics）
//!
//! 最终的选择结果通过 `QueueCapabilities` 对外公开，调用方可以据此判断
//! 实际能获得多少并行度。

use crate::core::error::{GraphicsError, Result};
use crate::handle::{CommandStreamHandle, QueueHandle, SemaphoreHandle};

/// 队列 / 命令流的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Transfer,
    Compute,
    /// 二级命令流：只能被主命令流通过 `execute_secondary` 引用，不能直接提交
    Secondary,
}

impl QueueType {
    pub fn name(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Transfer => "transfer",
            QueueType::Compute => "compute",
            QueueType::Secondary => "secondary",
        }
    }
}

/// 硬件队列族能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyDesc {
    pub index: u32,
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub queue_count: u32,
}

/// 某条主队列的实际落点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAliasing {
    /// 专用队列族
    Dedicated,
    /// 与图形队列不同的硬件队列，但所在队列族还具备其他能力
    Shared,
    /// 与主图形队列是同一条硬件队列
    AliasedGraphics,
}

/// 可查询的队列能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapabilities {
    pub transfer: QueueAliasing,
    pub compute: QueueAliasing,
    /// 实际创建的额外图形队列数
    pub extra_graphics_queues: u32,
}

/// 一条硬件队列（队列族 + 族内下标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeQueueSlot {
    pub family: u32,
    pub index: u32,
}

/// 等待信号量时使用的管线阶段
///
/// 由队列所在硬件队列族的能力决定，而不是由逻辑队列类型决定：
/// 复用图形队列的计算 / 传输队列按图形队列族的阶段等待。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    /// 所有图形阶段
    AllGraphics,
    /// 颜色附件输出（等待交换链图像获取）
    ColorOutput,
    /// 计算着色器
    Compute,
    /// 拷贝
    Transfer,
}

/// 队列族的能力摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyCaps {
    pub graphics: bool,
    pub compute: bool,
}

impl FamilyCaps {
    /// 普通等待使用的阶段
    pub fn wait_stage(self) -> WaitStage {
        if self.graphics {
            WaitStage::AllGraphics
        } else if self.compute {
            WaitStage::Compute
        } else {
            WaitStage::Transfer
        }
    }

    /// 等待交换链图像获取时使用的阶段
    pub fn acquire_wait_stage(self) -> WaitStage {
        if self.graphics {
            WaitStage::ColorOutput
        } else {
            self.wait_stage()
        }
    }
}

/// 初始化时确定的队列布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLayout {
    pub graphics: NativeQueueSlot,
    pub transfer: NativeQueueSlot,
    pub compute: NativeQueueSlot,
    pub extra_graphics: Vec<NativeQueueSlot>,
    pub capabilities: QueueCapabilities,
    families: Vec<QueueFamilyDesc>,
}

impl QueueLayout {
    /// 根据队列族能力选择队列
    ///
    /// # 参数
    ///
    /// * `families` - 硬件队列族列表
    /// * `extra_graphics` - 希望额外申请的图形队列数（上限）
    pub fn select(families: &[QueueFamilyDesc], extra_graphics: u32) -> Result<Self> {
        let graphics_family = families
            .iter()
            .find(|f| f.graphics && f.compute && f.queue_count > 0)
            .or_else(|| families.iter().find(|f| f.graphics && f.queue_count > 0))
            .ok_or_else(|| GraphicsError::DeviceCreation("no graphics-capable queue family".into()))?;

        let mut used: Vec<(u32, u32)> = families.iter().map(|f| (f.index, 0)).collect();
        let mut take = |family: u32| -> Option<NativeQueueSlot> {
            let desc = families.iter().find(|f| f.index == family)?;
            let entry = used.iter_mut().find(|(index, _)| *index == family)?;
            (entry.1 < desc.queue_count).then(|| {
                entry.1 += 1;
                NativeQueueSlot { family, index: entry.1 - 1 }
            })
        };

        let graphics = take(graphics_family.index)
            .ok_or_else(|| GraphicsError::DeviceCreation("graphics family has no queues".into()))?;

        // 两类队列都先取专用族，之后才退到共享
        // 专用传输族：只具备传输能力
        let transfer_dedicated = families
            .iter()
            .filter(|f| f.transfer && !f.graphics && !f.compute)
            .find_map(|f| take(f.index));
        // 专用计算族：具备计算能力但不具备图形能力
        let compute_dedicated = families
            .iter()
            .filter(|f| f.compute && !f.graphics)
            .find_map(|f| take(f.index));

        let (transfer, transfer_aliasing) = match transfer_dedicated {
            Some(slot) => (slot, QueueAliasing::Dedicated),
            None => {
                let shared = families
                    .iter()
                    .filter(|f| f.transfer && f.index != graphics_family.index)
                    .find_map(|f| take(f.index))
                    .or_else(|| take(graphics_family.index));
                match shared {
                    Some(slot) => (slot, QueueAliasing::Shared),
                    None => (graphics, QueueAliasing::AliasedGraphics),
                }
            }
        };

        let (compute, compute_aliasing) = match compute_dedicated {
            Some(slot) => (slot, QueueAliasing::Dedicated),
            None => match graphics_family.compute.then(|| take(graphics_family.index)).flatten() {
                Some(slot) => (slot, QueueAliasing::Shared),
                None => (graphics, QueueAliasing::AliasedGraphics),
            },
        };

        let extra_graphics: Vec<NativeQueueSlot> = (0..extra_graphics)
            .map_while(|_| take(graphics_family.index))
            .collect();

        let capabilities = QueueCapabilities {
            transfer: transfer_aliasing,
            compute: compute_aliasing,
            extra_graphics_queues: extra_graphics.len() as u32,
        };

        Ok(Self {
            graphics,
            transfer,
            compute,
            extra_graphics,
            capabilities,
            families: families.to_vec(),
        })
    }

    /// 主队列的落点
    pub fn primary(&self, ty: QueueType) -> NativeQueueSlot {
        match ty {
            QueueType::Graphics | QueueType::Secondary => self.graphics,
            QueueType::Transfer => self.transfer,
            QueueType::Compute => self.compute,
        }
    }

    /// 第 `n` 个额外图形队列；超出池大小时复用池中最后一条（池为空时复用主图形队列）
    pub fn extra_graphics_slot(&self, n: usize) -> NativeQueueSlot {
        self.extra_graphics
            .get(n)
            .or(self.extra_graphics.last())
            .copied()
            .unwrap_or(self.graphics)
    }

    /// 设备创建时每个队列族需要申请的队列数
    pub fn queue_counts(&self) -> Vec<(u32, u32)> {
        let mut counts: Vec<(u32, u32)> = Vec::new();
        for slot in self.unique_slots() {
            match counts.iter_mut().find(|(family, _)| *family == slot.family) {
                Some(entry) => entry.1 = entry.1.max(slot.index + 1),
                None => counts.push((slot.family, slot.index + 1)),
            }
        }
        counts
    }

    /// 去重后的全部硬件队列
    pub fn unique_slots(&self) -> Vec<NativeQueueSlot> {
        let mut slots = vec![self.graphics, self.transfer, self.compute];
        slots.extend(self.extra_graphics.iter().copied());
        let mut unique: Vec<NativeQueueSlot> = Vec::with_capacity(slots.len());
        for slot in slots {
            if !unique.contains(&slot) {
                unique.push(slot);
            }
        }
        unique
    }

    pub fn family_caps(&self, family: u32) -> FamilyCaps {
        self.families
            .iter()
            .find(|f| f.index == family)
            .map(|f| FamilyCaps { graphics: f.graphics, compute: f.compute })
            .unwrap_or(FamilyCaps { graphics: false, compute: false })
    }
}

/// 信号量与目标值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreValue {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
}

/// 一次提交的描述
#[derive(Debug, Clone, Default)]
pub struct SubmitDesc {
    pub queue: QueueHandle,
    pub streams: Vec<CommandStreamHandle>,
    /// 额外等待的用户信号量（原样透传）
    pub waits: Vec<SemaphoreValue>,
    /// 额外触发的用户信号量（原样透传）
    pub signals: Vec<SemaphoreValue>,
}

impl SubmitDesc {
    pub fn new(queue: QueueHandle, streams: &[CommandStreamHandle]) -> Self {
        Self {
            queue,
            streams: streams.to_vec(),
            waits: Vec::new(),
            signals: Vec::new(),
        }
    }
}

/// 队列的时间线进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProgress {
    /// 最近一次提交触发的时间线值
    pub submitted: u64,
    /// GPU 已完成的时间线值
    pub completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, graphics: bool, compute: bool, transfer: bool, queue_count: u32) -> QueueFamilyDesc {
        QueueFamilyDesc { index, graphics, compute, transfer, queue_count }
    }

    #[test]
    fn test_dedicated_families_preferred() {
        let families = [
            family(0, true, true, true, 16),
            family(1, false, true, true, 8),
            family(2, false, false, true, 2),
        ];
        let layout = QueueLayout::select(&families, 2).unwrap();

        assert_eq!(layout.graphics, NativeQueueSlot { family: 0, index: 0 });
        assert_eq!(layout.transfer, NativeQueueSlot { family: 2, index: 0 });
        assert_eq!(layout.compute, NativeQueueSlot { family: 1, index: 0 });
        assert_eq!(layout.capabilities.transfer, QueueAliasing::Dedicated);
        assert_eq!(layout.capabilities.compute, QueueAliasing::Dedicated);
        assert_eq!(layout.extra_graphics.len(), 2);
        assert_eq!(layout.queue_counts(), vec![(0, 3), (2, 1), (1, 1)]);
    }

    #[test]
    fn test_compute_dedicated_family_is_not_taken_by_transfer() {
        let families = [family(0, true, true, true, 4), family(1, false, true, true, 1)];
        let layout = QueueLayout::select(&families, 0).unwrap();

        // 族 1 唯一的队列归计算，传输退到图形族的第二条队列
        assert_eq!(layout.compute, NativeQueueSlot { family: 1, index: 0 });
        assert_eq!(layout.capabilities.compute, QueueAliasing::Dedicated);
        assert_eq!(layout.transfer, NativeQueueSlot { family: 0, index: 1 });
        assert_eq!(layout.capabilities.transfer, QueueAliasing::Shared);
    }

    #[test]
    fn test_shared_fallback() {
        let families = [family(0, true, true, true, 4), family(1, false, true, true, 2)];
        let layout = QueueLayout::select(&families, 0).unwrap();

        // 计算先拿走族 1 的第一条队列，传输共享族 1 的第二条
        assert_eq!(layout.compute, NativeQueueSlot { family: 1, index: 0 });
        assert_eq!(layout.capabilities.compute, QueueAliasing::Dedicated);
        assert_eq!(layout.transfer, NativeQueueSlot { family: 1, index: 1 });
        assert_eq!(layout.capabilities.transfer, QueueAliasing::Shared);
    }

    #[test]
    fn test_single_queue_aliases_graphics() {
        let families = [family(0, true, true, true, 1)];
        let layout = QueueLayout::select(&families, 3).unwrap();

        assert_eq!(layout.transfer, layout.graphics);
        assert_eq!(layout.compute, layout.graphics);
        assert_eq!(layout.capabilities.transfer, QueueAliasing::AliasedGraphics);
        assert_eq!(layout.capabilities.compute, QueueAliasing::AliasedGraphics);
        assert_eq!(layout.capabilities.extra_graphics_queues, 0);
        assert_eq!(layout.extra_graphics_slot(5), layout.graphics);
        assert_eq!(layout.unique_slots().len(), 1);
    }

    #[test]
    fn test_extra_graphics_requests_alias_last() {
        let families = [family(0, true, true, true, 3)];
        let layout = QueueLayout::select(&families, 4).unwrap();

        // 图形、传输、计算用掉全部三条，额外池为空
        assert_eq!(layout.extra_graphics.len(), 0);
        let families = [family(0, true, true, true, 6)];
        let layout = QueueLayout::select(&families, 2).unwrap();
        assert_eq!(layout.extra_graphics.len(), 2);
        assert_eq!(layout.extra_graphics_slot(7), layout.extra_graphics[1]);
    }

    #[test]
    fn test_wait_stage_follows_real_family() {
        let families = [family(0, true, true, true, 1), family(2, false, false, true, 1)];
        let layout = QueueLayout::select(&families, 0).unwrap();

        // 计算队列复用了图形族，因此按图形阶段等待
        assert_eq!(layout.family_caps(layout.compute.family).wait_stage(), WaitStage::AllGraphics);
        assert_eq!(layout.family_caps(layout.transfer.family).wait_stage(), WaitStage::Transfer);
        assert_eq!(layout.family_caps(layout.transfer.family).acquire_wait_stage(), WaitStage::Transfer);
        assert_eq!(layout.family_caps(0).acquire_wait_stage(), WaitStage::ColorOutput);
    }

    #[test]
    fn test_no_graphics_family_fails() {
        let families = [family(0, false, true, true, 1)];
        assert!(QueueLayout::select(&families, 0).is_err());
    }
}

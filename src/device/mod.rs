//! 设备
//!
//! `Device<B>` 实现与后端无关的全部逻辑：句柄表、队列与提交、帧生命周期、
//! 命令流关闭、暂存资源回收、交换链获取与呈现。后端只提供原生原语。
//!
//! # 锁顺序
//!
//! 需要同时持有多把锁时，按以下顺序获取：
//!
//! 帧状态 -> 资源表 -> 队列表 -> 交换链表 -> 队列状态（按句柄升序）-> 命令流表 -> 信号量表
//!
//! `thread_safe_resources` 打开时的创建锁位于所有锁之前。
//! 额外图形队列的空闲表不与其他锁嵌套持有。

mod lifecycle;
mod resources;
mod semaphores;
mod streams;
mod submit;
mod swapchains;
pub(crate) mod tables;

#[cfg(test)]
mod tests;

use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, SemaphoreKind, WaitStatus};
use crate::core::config::Config;
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::{lock, read, write, SpinLock};
use crate::frame::FrameState;
use crate::gpu_fatal;
use crate::handle::{
    CommandStreamHandle, Handle, HandleTable, QueueHandle, SemaphoreHandle, SwapchainHandle,
};
use crate::queue::{NativeQueueSlot, QueueCapabilities, QueueProgress, QueueType};
use crate::swapchain::SwapchainEntry;

use streams::StreamSlot;
use tables::{Resources, TextureEntry};

/// 一条原生硬件队列及其提交锁
struct NativeQueue<B: Backend> {
    slot: NativeQueueSlot,
    queue: B::Queue,
    lock: SpinLock,
}

/// 每个飞行帧的队列同步状态
struct QueueFrame<B: Backend> {
    /// 该飞行帧最近一次提交触发的时间线值
    wait_value: u64,
    /// 该飞行帧是否向本队列提交过
    used: bool,
    /// 呈现前等待的二值信号量池
    submit_semaphores: Vec<B::Semaphore>,
    cursor: usize,
}

impl<B: Backend> QueueFrame<B> {
    fn new() -> Self {
        Self {
            wait_value: 0,
            used: false,
            submit_semaphores: Vec::new(),
            cursor: 0,
        }
    }
}

/// 逻辑队列
struct QueueState<B: Backend> {
    ty: QueueType,
    /// `Device::native_queues` 中的下标
    native: usize,
    family: u32,
    timeline: B::Semaphore,
    /// 最近一次提交触发的时间线值
    value: u64,
    frames: Vec<QueueFrame<B>>,
    /// 占用的额外图形队列池下标，主队列和池耗尽后的复用队列为 `None`
    pool_index: Option<usize>,
}

/// 图形设备
pub struct Device<B: Backend> {
    backend: B,
    config: Config,
    frame: RwLock<FrameState>,
    resources: Mutex<Resources<B>>,
    queues: RwLock<HandleTable<QueueHandle, Mutex<QueueState<B>>>>,
    native_queues: Vec<NativeQueue<B>>,
    /// 图形、传输、计算三条主队列
    primary: [QueueHandle; 3],
    /// 额外图形队列池中空闲的下标，末尾是下一个分配的
    free_extra_graphics: Mutex<Vec<usize>>,
    streams: Mutex<HandleTable<CommandStreamHandle, StreamSlot<B>>>,
    semaphores: RwLock<HandleTable<SemaphoreHandle, B::Semaphore>>,
    swapchains: Mutex<HandleTable<SwapchainHandle, SwapchainEntry<B>>>,
    creation_lock: Mutex<()>,
}

impl<B: Backend> Device<B> {
    /// 创建后端并初始化设备
    ///
    /// # 参数
    ///
    /// * `config` - 设备配置（在设备生命周期内保持只读）
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let backend = B::new(config)?;
        Self::with_backend(backend, config)
    }

    /// 使用已经创建好的后端初始化设备
    pub fn with_backend(backend: B, config: &Config) -> Result<Self> {
        config.validate()?;

        let layout = backend.queue_layout().clone();
        let native_queues = layout
            .unique_slots()
            .into_iter()
            .map(|slot| {
                Ok(NativeQueue {
                    slot,
                    queue: backend.native_queue(slot)?,
                    lock: SpinLock::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut device = Self {
            backend,
            config: config.clone(),
            frame: RwLock::new(FrameState::new(
                config.frames_in_flight(),
                config.graphics.max_submissions_per_frame,
            )),
            resources: Mutex::new(Resources::new()),
            queues: RwLock::new(HandleTable::new(8)),
            native_queues,
            primary: [QueueHandle::INVALID; 3],
            free_extra_graphics: Mutex::new((0..layout.extra_graphics.len()).rev().collect()),
            streams: Mutex::new(HandleTable::new(64)),
            semaphores: RwLock::new(HandleTable::new(16)),
            swapchains: Mutex::new(HandleTable::new(4)),
            creation_lock: Mutex::new(()),
        };

        device.primary = [
            device.add_queue(QueueType::Graphics, layout.graphics, None)?,
            device.add_queue(QueueType::Transfer, layout.transfer, None)?,
            device.add_queue(QueueType::Compute, layout.compute, None)?,
        ];

        info!(
            backend = B::NAME,
            frames_in_flight = config.frames_in_flight(),
            native_queues = device.native_queues.len(),
            transfer = ?layout.capabilities.transfer,
            compute = ?layout.capabilities.compute,
            "Device initialized"
        );

        Ok(device)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        B::NAME
    }

    /// 当前飞行帧下标
    pub fn frame_index(&self) -> usize {
        read(&self.frame).frame_index()
    }

    /// 已结束的帧总数
    pub fn total_frames(&self) -> u64 {
        read(&self.frame).total_frames()
    }

    fn sync_timeout(&self) -> Duration {
        self.config.sync_timeout()
    }

    fn frames_in_flight(&self) -> usize {
        self.config.frames_in_flight()
    }

    /// `thread_safe_resources` 打开时串行化创建 / 销毁
    fn creation_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.config
            .graphics
            .thread_safe_resources
            .then(|| lock(&self.creation_lock))
    }

    // ---- 队列 ----

    fn add_queue(&self, ty: QueueType, slot: NativeQueueSlot, pool_index: Option<usize>) -> Result<QueueHandle> {
        let native = self
            .native_queues
            .iter()
            .position(|q| q.slot == slot)
            .ok_or_else(|| {
                GraphicsError::DeviceCreation(format!("queue {:?} was not requested at device creation", slot))
            })?;

        let timeline = self.backend.create_semaphore(SemaphoreKind::Timeline { initial: 0 })?;
        let state = QueueState {
            ty,
            native,
            family: slot.family,
            timeline,
            value: 0,
            frames: (0..self.frames_in_flight()).map(|_| QueueFrame::new()).collect(),
            pool_index,
        };

        let handle = write(&self.queues).add(Mutex::new(state));
        debug!(?handle, queue_type = ty.name(), family = slot.family, index = slot.index, "Queue created");
        Ok(handle)
    }

    /// 三条主队列之一
    ///
    /// 二级命令流不是提交目标，请求 `Secondary` 返回 `QueueHandle::INVALID`。
    pub fn primary_queue(&self, ty: QueueType) -> QueueHandle {
        match ty {
            QueueType::Graphics => self.primary[0],
            QueueType::Transfer => self.primary[1],
            QueueType::Compute => self.primary[2],
            QueueType::Secondary => {
                error!("Secondary is not a queue type, it can only be recorded");
                QueueHandle::INVALID
            }
        }
    }

    /// 从额外图形队列池中创建一条图形队列
    ///
    /// 销毁的队列会把硬件队列归还到池中。池耗尽后复用池中最后一条硬件队列
    /// （池为空时复用主图形队列），不会失败。
    pub fn create_queue(&self, ty: QueueType) -> Result<QueueHandle> {
        if ty != QueueType::Graphics {
            return Err(GraphicsError::InvalidHandle(format!(
                "only graphics queues can be created, use primary_queue for {}",
                ty.name()
            ))
            .into());
        }

        let _guard = self.creation_guard();
        let layout = self.backend.queue_layout();
        let pool_index = lock(&self.free_extra_graphics).pop();
        let slot = match pool_index {
            Some(index) => layout.extra_graphics[index],
            None => {
                warn!(
                    pool = layout.extra_graphics.len(),
                    "Extra graphics queue pool exhausted, aliasing an existing queue"
                );
                layout.extra_graphics_slot(layout.extra_graphics.len())
            }
        };
        let handle = self.add_queue(ty, slot, pool_index);
        if let (Err(_), Some(index)) = (&handle, pool_index) {
            lock(&self.free_extra_graphics).push(index);
        }
        handle
    }

    /// 销毁通过 `create_queue` 创建的队列
    pub fn destroy_queue(&self, handle: QueueHandle) {
        if self.primary.contains(&handle) {
            error!(?handle, "Primary queues cannot be destroyed");
            return;
        }

        let _guard = self.creation_guard();
        let Some(state) = write(&self.queues).remove(handle) else {
            error!(?handle, "Destroying an invalid queue handle");
            return;
        };
        let state = state.into_inner().unwrap_or_else(|e| e.into_inner());
        let pool_index = state.pool_index;
        self.release_queue(handle, state);
        if let Some(index) = pool_index {
            lock(&self.free_extra_graphics).push(index);
        }
    }

    fn release_queue(&self, handle: QueueHandle, state: QueueState<B>) {
        if state.value > 0 {
            match self.backend.wait_semaphores(&[(&state.timeline, state.value)], self.sync_timeout()) {
                Ok(WaitStatus::Ready) => {}
                Ok(WaitStatus::Timeout) => gpu_fatal!("Timed out draining queue {:?}", handle),
                Err(e) => error!(?handle, "Failed to drain queue: {}", e),
            }
        }
        for frame in state.frames {
            for semaphore in frame.submit_semaphores {
                self.backend.destroy_semaphore(semaphore);
            }
        }
        self.backend.destroy_semaphore(state.timeline);
    }

    /// 实际获得的队列能力（专用 / 共享 / 复用图形队列）
    pub fn queue_capabilities(&self) -> QueueCapabilities {
        self.backend.queue_layout().capabilities
    }

    /// 队列的时间线进度
    pub fn queue_progress(&self, handle: QueueHandle) -> Result<QueueProgress> {
        let queues = read(&self.queues);
        let state = queues
            .get(handle)
            .ok_or_else(|| GraphicsError::InvalidHandle(format!("{:?}", handle)))?;
        let state = lock(state);
        Ok(QueueProgress {
            submitted: state.value,
            completed: self.backend.semaphore_value(&state.timeline)?,
        })
    }

    /// 阻塞直到所有队列上已提交的工作完成
    pub fn join(&self) -> Result<()> {
        {
            let queues = read(&self.queues);
            let guards: Vec<_> = queues.iter().map(|(_, q)| lock(q)).collect();
            let waits: Vec<(&B::Semaphore, u64)> = guards
                .iter()
                .filter(|q| q.value > 0)
                .map(|q| (&q.timeline, q.value))
                .collect();

            if !waits.is_empty() {
                if let WaitStatus::Timeout = self.backend.wait_semaphores(&waits, self.sync_timeout())? {
                    gpu_fatal!("Timed out waiting for {} queue(s) to drain", waits.len());
                }
            }
        }
        self.backend.wait_idle()
    }

    // ---- 关闭 ----

    /// 等待 GPU 空闲，报告并释放所有仍然存活的对象
    fn shutdown(&mut self) {
        if let Err(e) = self.join() {
            error!("Failed to drain queues at shutdown: {}", e);
        }

        let backend = &self.backend;
        let resources = self.resources.get_mut().unwrap_or_else(|e| e.into_inner());
        let swapchains = self.swapchains.get_mut().unwrap_or_else(|e| e.into_inner());

        report_leaks(swapchains, |_, entry| {
            resources.textures.remove(entry.texture);
            for semaphore in entry.image_acquired {
                backend.destroy_semaphore(semaphore);
            }
            backend.destroy_swapchain(entry.native);
        });

        let streams = self.streams.get_mut().unwrap_or_else(|e| e.into_inner());
        report_leaks(streams, |_, slot| slot.release(backend));

        report_leaks(&mut resources.descriptor_sets, |_, e| backend.destroy_descriptor_set(e.native));
        report_leaks(&mut resources.pipelines, |_, e| backend.destroy_pipeline(e.native));
        report_leaks(&mut resources.pipeline_layouts, |_, e| backend.destroy_pipeline_layout(e.native));
        report_leaks(&mut resources.shaders, |_, e| backend.destroy_shader(e.native));
        report_leaks(&mut resources.samplers, |_, s| backend.destroy_sampler(s));
        report_leaks(&mut resources.textures, |_, e| {
            if let TextureEntry::Native { native, .. } = e {
                backend.destroy_texture(native);
            }
        });
        report_leaks(&mut resources.buffers, |_, e| backend.destroy_buffer(e.native));

        let semaphores = self.semaphores.get_mut().unwrap_or_else(|e| e.into_inner());
        report_leaks(semaphores, |_, s| backend.destroy_semaphore(s));

        let mut queues = std::mem::take(self.queues.get_mut().unwrap_or_else(|e| e.into_inner()));
        for (handle, state) in queues.drain() {
            if !self.primary.contains(&handle) {
                warn!(?handle, "Leaked queue at shutdown");
            }
            let state = state.into_inner().unwrap_or_else(|e| e.into_inner());
            self.release_queue(handle, state);
        }

        info!(backend = B::NAME, "Device destroyed");
    }
}

/// 遍历到高水位的全部槽位，逐个报告并释放仍存活的对象
fn report_leaks<H: Handle, T>(table: &mut HandleTable<H, T>, mut release: impl FnMut(H, T)) {
    let high_water = table.next_free_id();
    for (handle, item) in table.drain() {
        warn!(kind = H::KIND, ?handle, high_water, "Leaked object at shutdown");
        release(handle, item);
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: Backend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &B::NAME)
            .field("frame_index", &self.frame_index())
            .field("total_frames", &self.total_frames())
            .finish_non_exhaustive()
    }
}

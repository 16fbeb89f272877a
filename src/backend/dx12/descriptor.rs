//! DirectX 12 描述符堆
//!
//! 每种堆类型在设备创建时分配一个定长堆，之后按区间分配：
//!
//! - RTV / DSV / 非着色器可见的 CBV_SRV_UAV 与采样器堆：纹理视图与采样器的 CPU 描述符
//! - 着色器可见的 CBV_SRV_UAV 与采样器堆：描述符集，每个集占一段连续区间

use std::sync::Mutex;
use windows::core::PCWSTR;
use windows::Win32::Graphics::Direct3D12::*;

use crate::core::error::{DistRhiError, GraphicsError, Result};
use crate::core::sync::lock;

/// 首次适配的区间分配器
///
/// 空闲区间按起点排序，释放时与相邻区间合并。
#[derive(Debug)]
pub(super) struct RangeAllocator {
    free: Vec<(u32, u32)>,
}

impl RangeAllocator {
    pub fn new(capacity: u32) -> Self {
        Self { free: vec![(0, capacity)] }
    }

    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        let count = count.max(1);
        let pos = self.free.iter().position(|(_, len)| *len >= count)?;
        let (start, len) = self.free[pos];
        if len == count {
            self.free.remove(pos);
        } else {
            self.free[pos] = (start + count, len - count);
        }
        Some(start)
    }

    pub fn free(&mut self, start: u32, count: u32) {
        let count = count.max(1);
        let pos = self.free.partition_point(|(s, _)| *s < start);
        self.free.insert(pos, (start, count));

        if pos + 1 < self.free.len() {
            let (next_start, next_len) = self.free[pos + 1];
            if start + count == next_start {
                self.free[pos].1 += next_len;
                self.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_start, prev_len) = self.free[pos - 1];
            if prev_start + prev_len == start {
                self.free[pos - 1].1 += self.free[pos].1;
                self.free.remove(pos);
            }
        }
    }

    pub fn available(&self) -> u32 {
        self.free.iter().map(|(_, len)| *len).sum()
    }
}

/// 描述符堆与它的区间分配器
pub(super) struct DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    ty: D3D12_DESCRIPTOR_HEAP_TYPE,
    increment_size: u32,
    cpu_start: usize,
    gpu_start: Option<u64>,
    allocator: Mutex<RangeAllocator>,
}

// 区间分配由互斥锁保护，堆本身的读写由调用方保证不重叠
unsafe impl Send for DescriptorHeap {}
unsafe impl Sync for DescriptorHeap {}

impl DescriptorHeap {
    /// 创建描述符堆
    ///
    /// # 参数
    ///
    /// * `device` - DX12 设备
    /// * `ty` - 堆类型
    /// * `capacity` - 描述符数量
    /// * `shader_visible` - 是否着色器可见（仅 CBV_SRV_UAV 与采样器堆）
    /// * `name` - 调试名称
    pub fn new(
        device: &ID3D12Device,
        ty: D3D12_DESCRIPTOR_HEAP_TYPE,
        capacity: u32,
        shader_visible: bool,
        name: &str,
    ) -> Result<Self> {
        unsafe {
            let desc = D3D12_DESCRIPTOR_HEAP_DESC {
                Type: ty,
                NumDescriptors: capacity,
                Flags: if shader_visible {
                    D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                } else {
                    D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                },
                NodeMask: 0,
            };
            let heap: ID3D12DescriptorHeap = device.CreateDescriptorHeap(&desc).map_err(|e| {
                DistRhiError::from(GraphicsError::ResourceCreation(format!(
                    "Failed to create {} descriptor heap: {:?}",
                    name, e
                )))
            })?;

            let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
            let _ = heap.SetName(PCWSTR(wide_name.as_ptr()));

            Ok(Self {
                increment_size: device.GetDescriptorHandleIncrementSize(ty),
                cpu_start: heap.GetCPUDescriptorHandleForHeapStart().ptr,
                gpu_start: shader_visible.then(|| heap.GetGPUDescriptorHandleForHeapStart().ptr),
                heap,
                ty,
                allocator: Mutex::new(RangeAllocator::new(capacity)),
            })
        }
    }

    pub fn raw(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }

    pub fn ty(&self) -> D3D12_DESCRIPTOR_HEAP_TYPE {
        self.ty
    }

    /// 分配 `count` 个连续描述符，返回起始下标
    pub fn allocate(&self, count: u32) -> Result<u32> {
        lock(&self.allocator).allocate(count).ok_or_else(|| {
            GraphicsError::ResourceCreation(format!(
                "descriptor heap {:?} exhausted ({} descriptors requested)",
                self.ty, count
            ))
            .into()
        })
    }

    pub fn free(&self, start: u32, count: u32) {
        lock(&self.allocator).free(start, count);
    }

    pub fn cpu_handle(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        D3D12_CPU_DESCRIPTOR_HANDLE { ptr: self.cpu_start + (index * self.increment_size) as usize }
    }

    /// 着色器可见堆中指定下标的 GPU 句柄；非着色器可见堆返回空句柄
    pub fn gpu_handle(&self, index: u32) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: self.gpu_start.map_or(0, |start| start + (index * self.increment_size) as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_allocation_first_fit() {
        let mut ranges = RangeAllocator::new(16);
        assert_eq!(ranges.allocate(4), Some(0));
        assert_eq!(ranges.allocate(4), Some(4));
        assert_eq!(ranges.allocate(8), Some(8));
        assert_eq!(ranges.allocate(1), None);
    }

    #[test]
    fn test_range_free_merges_neighbours() {
        let mut ranges = RangeAllocator::new(12);
        let a = ranges.allocate(4).unwrap();
        let b = ranges.allocate(4).unwrap();
        let c = ranges.allocate(4).unwrap();

        ranges.free(a, 4);
        ranges.free(c, 4);
        assert_eq!(ranges.allocate(8), None);

        ranges.free(b, 4);
        assert_eq!(ranges.available(), 12);
        assert_eq!(ranges.allocate(12), Some(0));
    }

    #[test]
    fn test_zero_sized_requests_take_one_slot() {
        let mut ranges = RangeAllocator::new(2);
        assert_eq!(ranges.allocate(0), Some(0));
        assert_eq!(ranges.available(), 1);
    }
}

//! 显存分配
//!
//! 缓冲区与图像从 gpu-allocator 管理的内存块中子分配。主机可见的分配由分配器持久映射。

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use std::ptr::NonNull;
use std::sync::Mutex;
use tracing::{debug, error};

use crate::core::error::{GraphicsError, Result};
use crate::core::sync::lock;
use crate::resource::MemoryLocation;

/// 持久映射的主机指针
///
/// 指向的内存由所属的分配管理，读写由调用方保证不与 GPU 访问重叠。
#[derive(Debug, Clone, Copy)]
pub(super) struct MappedPtr(NonNull<u8>);

impl MappedPtr {
    /// 主机不可见的分配返回 `None`
    pub fn of(allocation: &Allocation) -> Option<Self> {
        allocation.mapped_ptr().map(|ptr| Self(ptr.cast()))
    }

    /// # Safety
    ///
    /// `offset + data.len()` 不能超出映射范围
    pub unsafe fn write(&self, offset: u64, data: &[u8]) {
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.0.as_ptr().add(offset as usize), data.len());
    }

    /// # Safety
    ///
    /// `offset + out.len()` 不能超出映射范围
    pub unsafe fn read(&self, offset: u64, out: &mut [u8]) {
        std::ptr::copy_nonoverlapping(self.0.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
    }
}

pub(super) fn location(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

/// 设备级的显存分配器
///
/// 分配器在逻辑设备销毁之前通过 `shutdown` 释放。
pub(super) struct MemoryAllocator {
    allocator: Mutex<Option<Allocator>>,
}

impl MemoryAllocator {
    pub fn new(instance: &ash::Instance, device: &ash::Device, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GraphicsError::DeviceCreation(format!("failed to create memory allocator: {}", e)))?;
        Ok(Self { allocator: Mutex::new(Some(allocator)) })
    }

    /// 按需求子分配一块内存
    ///
    /// # 参数
    ///
    /// * `name` - 分配器泄漏报告中使用的名字
    /// * `linear` - 缓冲区与线性图像为 `true`，最优平铺的图像为 `false`
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        memory: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = lock(&self.allocator);
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| GraphicsError::ResourceCreation("memory allocator already shut down".into()))?;
        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: location(memory),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GraphicsError::ResourceCreation(format!("{} ({:?}): {}", name, memory, e)))?;
        Ok(allocation)
    }

    pub fn free(&self, allocation: Allocation) {
        let mut allocator = lock(&self.allocator);
        let Some(allocator) = allocator.as_mut() else {
            error!("Freeing an allocation after the memory allocator was shut down");
            return;
        };
        if let Err(e) = allocator.free(allocation) {
            error!("Failed to free device memory: {}", e);
        }
    }

    /// 释放所有内存块；之后的分配全部失败
    pub fn shutdown(&self) {
        if lock(&self.allocator).take().is_some() {
            debug!("Vulkan memory allocator released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_location_mapping() {
        assert_eq!(location(MemoryLocation::GpuOnly), gpu_allocator::MemoryLocation::GpuOnly);
        assert_eq!(location(MemoryLocation::CpuToGpu), gpu_allocator::MemoryLocation::CpuToGpu);
        assert_eq!(location(MemoryLocation::GpuToCpu), gpu_allocator::MemoryLocation::GpuToCpu);
    }
}

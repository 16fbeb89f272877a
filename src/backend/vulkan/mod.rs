//! Vulkan 后端（ash）
//!
//! 要求 Vulkan 1.3：时间线信号量、动态渲染与 synchronization2 都直接使用核心接口。
//!
//! - 每个命令列表独占一个命令池，重新录制前整体重置
//! - 缓冲区与图像的显存由 gpu-allocator 子分配，跨队列族共享时使用 `CONCURRENT` 模式
//! - 交换链图像的布局由编码器自动转换，普通纹理完全按调用方的屏障转换
//! - 二级命令列表不继承渲染通道，只能在渲染通道之外执行

mod convert;
mod device;
mod encoder;
mod memory;
mod pipeline;
mod swapchain;

pub use encoder::VulkanEncoder;

use ash::extensions::khr;
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::Allocation;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CString;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tracing::{debug, info, warn};

use self::device::DeviceContext;
use self::memory::{MappedPtr, MemoryAllocator};
use super::{
    AcquireResult, Backend, BufferWrite, CommandListLevel, EncodeContext, ImageWrite, PresentResult,
    SemaphoreKind, SubmitBatch, WaitStatus,
};
use crate::core::config::Config;
use crate::core::error::{DistRhiError, GraphicsError, Result};
use crate::queue::{NativeQueueSlot, QueueLayout};
use crate::resource::{
    BufferDesc, DescriptorBinding, DescriptorSetLayoutDesc, MemoryLocation, PipelineLayoutDesc, SamplerDesc,
    TextureDesc, TextureDimension,
};
use crate::shader::{CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ShaderStage, ShaderTarget};
use crate::swapchain::SwapchainDesc;

/// 把 `vk::Result` 包装为带调用名的错误
pub(super) fn vk_error(call: &'static str) -> impl Fn(vk::Result) -> DistRhiError {
    move |result| GraphicsError::CommandExecution(format!("{} failed: {}", call, result)).into()
}

pub struct VulkanQueue {
    raw: vk::Queue,
    family: u32,
}

pub struct VulkanSemaphore {
    raw: vk::Semaphore,
    timeline: bool,
}

pub struct VulkanBuffer {
    raw: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

pub struct VulkanTexture {
    image: vk::Image,
    allocation: Allocation,
    view: vk::ImageView,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent3D,
}

pub struct VulkanSampler {
    raw: vk::Sampler,
}

pub struct VulkanShader {
    modules: Vec<(ShaderStage, vk::ShaderModule, CString)>,
}

pub struct VulkanPipelineLayout {
    raw: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
}

pub struct VulkanPipeline {
    raw: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

pub struct VulkanDescriptorSet {
    pool: vk::DescriptorPool,
    raw: vk::DescriptorSet,
}

pub struct VulkanCommandList {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    level: CommandListLevel,
}

pub struct VulkanSwapchain {
    surface: vk::SurfaceKHR,
    raw: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    vsync: bool,
    image_count: u32,
    /// 每张图像最近一次被编码写入的帧号
    written: Vec<AtomicU64>,
}

/// Vulkan 后端
pub struct VulkanBackend {
    ctx: DeviceContext,
    memory: MemoryAllocator,
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,
    /// 所有申请过队列的队列族，用于跨族共享的资源
    families: Vec<u32>,
}

impl VulkanBackend {
    fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    fn sharing(&self) -> (vk::SharingMode, &[u32]) {
        if self.families.len() > 1 {
            (vk::SharingMode::CONCURRENT, &self.families)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        }
    }

    fn set_name<H: Handle>(&self, object_type: vk::ObjectType, handle: H, name: Option<&str>) {
        let (Some(debug_utils), Some(name)) = (&self.ctx.debug_utils, name) else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device().handle(), &info) } {
            debug!("Failed to name Vulkan object: {}", e);
        }
    }

    fn host_range(buffer: &VulkanBuffer, offset: u64, len: usize) -> Result<MappedPtr> {
        let mapped = MappedPtr::of(&buffer.allocation)
            .ok_or_else(|| DistRhiError::Runtime("buffer is not host visible".into()))?;
        if offset.saturating_add(len as u64) > buffer.size {
            return Err(DistRhiError::Runtime(format!(
                "host access of {} bytes at offset {} exceeds buffer size {}",
                len, offset, buffer.size
            )));
        }
        Ok(mapped)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during shutdown: {}", e);
            }
            self.memory.shutdown();
            self.ctx.destroy();
        }
        info!("Vulkan backend destroyed");
    }
}

impl Backend for VulkanBackend {
    type Queue = VulkanQueue;
    type Semaphore = VulkanSemaphore;
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type Sampler = VulkanSampler;
    type Shader = VulkanShader;
    type PipelineLayout = VulkanPipelineLayout;
    type Pipeline = VulkanPipeline;
    type DescriptorSet = VulkanDescriptorSet;
    type CommandList = VulkanCommandList;
    type Swapchain = VulkanSwapchain;
    type Encoder<'a> = VulkanEncoder<'a>;

    const NAME: &'static str = "Vulkan";
    const SHADER_TARGET: ShaderTarget = ShaderTarget::Spirv;

    fn new(config: &Config) -> Result<Self> {
        let mut ctx = DeviceContext::new(config)?;
        let memory = match MemoryAllocator::new(&ctx.instance, &ctx.device, ctx.physical_device) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { ctx.destroy() };
                return Err(e);
            }
        };
        let surface_loader = khr::Surface::new(&ctx.entry, &ctx.instance);
        let swapchain_loader = khr::Swapchain::new(&ctx.instance, &ctx.device);
        let mut families: Vec<u32> = ctx.layout.queue_counts().iter().map(|(family, _)| *family).collect();
        families.sort_unstable();
        families.dedup();

        info!(validation = config.graphics.validation, families = ?families, "Vulkan backend initialized");
        Ok(Self { ctx, memory, surface_loader, swapchain_loader, families })
    }

    fn queue_layout(&self) -> &QueueLayout {
        &self.ctx.layout
    }

    fn native_queue(&self, slot: NativeQueueSlot) -> Result<VulkanQueue> {
        if !self.ctx.layout.unique_slots().contains(&slot) {
            return Err(GraphicsError::DeviceCreation(format!("queue {:?} was not requested", slot)).into());
        }
        let raw = unsafe { self.device().get_device_queue(slot.family, slot.index) };
        Ok(VulkanQueue { raw, family: slot.family })
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device().device_wait_idle() }.map_err(vk_error("vkDeviceWaitIdle"))
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<VulkanSemaphore> {
        let (timeline, initial) = match kind {
            SemaphoreKind::Timeline { initial } => (true, initial),
            SemaphoreKind::Binary => (false, 0),
        };
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let mut info = vk::SemaphoreCreateInfo::builder();
        if timeline {
            info = info.push_next(&mut type_info);
        }
        let raw = unsafe { self.device().create_semaphore(&info, None) }.map_err(vk_error("vkCreateSemaphore"))?;
        Ok(VulkanSemaphore { raw, timeline })
    }

    fn destroy_semaphore(&self, semaphore: VulkanSemaphore) {
        unsafe { self.device().destroy_semaphore(semaphore.raw, None) };
    }

    fn semaphore_value(&self, semaphore: &VulkanSemaphore) -> Result<u64> {
        if !semaphore.timeline {
            return Err(DistRhiError::Runtime("binary semaphores have no counter value".into()));
        }
        unsafe { self.device().get_semaphore_counter_value(semaphore.raw) }
            .map_err(vk_error("vkGetSemaphoreCounterValue"))
    }

    fn signal_semaphore(&self, semaphore: &VulkanSemaphore, value: u64) -> Result<()> {
        let info = vk::SemaphoreSignalInfo::builder().semaphore(semaphore.raw).value(value);
        unsafe { self.device().signal_semaphore(&info) }.map_err(vk_error("vkSignalSemaphore"))
    }

    fn wait_semaphores(&self, waits: &[(&VulkanSemaphore, u64)], timeout: Duration) -> Result<WaitStatus> {
        if waits.is_empty() {
            return Ok(WaitStatus::Ready);
        }
        let semaphores: Vec<vk::Semaphore> = waits.iter().map(|(s, _)| s.raw).collect();
        let values: Vec<u64> = waits.iter().map(|(_, v)| *v).collect();
        let info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe { self.device().wait_semaphores(&info, timeout) } {
            Ok(()) => Ok(WaitStatus::Ready),
            Err(vk::Result::TIMEOUT) => Ok(WaitStatus::Timeout),
            Err(e) => Err(vk_error("vkWaitSemaphores")(e)),
        }
    }

    fn submit(&self, queue: &VulkanQueue, batch: &SubmitBatch<'_, Self>) -> Result<()> {
        let waits: Vec<vk::SemaphoreSubmitInfo> = batch
            .waits
            .iter()
            .map(|w| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(w.semaphore.raw)
                    .value(w.value)
                    .stage_mask(convert::wait_stage(w.stage))
                    .build()
            })
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = batch
            .signals
            .iter()
            .map(|s| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(s.semaphore.raw)
                    .value(s.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build()
            })
            .collect();
        let lists: Vec<vk::CommandBufferSubmitInfo> = batch
            .command_lists
            .iter()
            .map(|list| vk::CommandBufferSubmitInfo::builder().command_buffer(list.buffer).build())
            .collect();

        let info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&lists)
            .signal_semaphore_infos(&signals)
            .build();

        unsafe { self.device().queue_submit2(queue.raw, &[info], vk::Fence::null()) }
            .map_err(vk_error("vkQueueSubmit2"))
    }

    fn create_command_list(&self, family: u32, level: CommandListLevel) -> Result<VulkanCommandList> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family);
        let pool =
            unsafe { self.device().create_command_pool(&pool_info, None) }.map_err(vk_error("vkCreateCommandPool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(match level {
                CommandListLevel::Primary => vk::CommandBufferLevel::PRIMARY,
                CommandListLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
            })
            .command_buffer_count(1);
        let buffer = match unsafe { self.device().allocate_command_buffers(&alloc_info) } {
            Ok(mut buffers) => buffers.pop(),
            Err(e) => {
                unsafe { self.device().destroy_command_pool(pool, None) };
                return Err(vk_error("vkAllocateCommandBuffers")(e));
            }
        };
        let Some(buffer) = buffer else {
            unsafe { self.device().destroy_command_pool(pool, None) };
            return Err(GraphicsError::ResourceCreation("no command buffer allocated".into()).into());
        };

        Ok(VulkanCommandList { pool, buffer, level })
    }

    fn destroy_command_list(&self, list: VulkanCommandList) {
        unsafe { self.device().destroy_command_pool(list.pool, None) };
    }

    fn begin_encoding<'a>(
        &'a self,
        list: &'a mut VulkanCommandList,
        ctx: EncodeContext<'a, Self>,
    ) -> Result<VulkanEncoder<'a>> {
        unsafe {
            self.device()
                .reset_command_pool(list.pool, vk::CommandPoolResetFlags::empty())
                .map_err(vk_error("vkResetCommandPool"))?;

            let inheritance = vk::CommandBufferInheritanceInfo::builder();
            let mut begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if list.level == CommandListLevel::Secondary {
                begin = begin.inheritance_info(&inheritance);
            }
            self.device()
                .begin_command_buffer(list.buffer, &begin)
                .map_err(vk_error("vkBeginCommandBuffer"))?;
        }
        Ok(VulkanEncoder::new(self, list.buffer, ctx))
    }

    fn end_encoding<'a>(&'a self, encoder: VulkanEncoder<'a>) -> Result<Vec<VulkanBuffer>> {
        encoder.finish()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<VulkanBuffer> {
        let (sharing, families) = self.sharing();
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size.max(1))
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(sharing)
            .queue_family_indices(families);
        let raw = unsafe { self.device().create_buffer(&info, None) }.map_err(vk_error("vkCreateBuffer"))?;

        let requirements = unsafe { self.device().get_buffer_memory_requirements(raw) };
        let name = desc.name.as_deref().unwrap_or("buffer");
        let allocation = match self.memory.allocate(name, requirements, desc.memory, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device().destroy_buffer(raw, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device().bind_buffer_memory(raw, allocation.memory(), allocation.offset()) } {
            unsafe { self.device().destroy_buffer(raw, None) };
            self.memory.free(allocation);
            return Err(vk_error("vkBindBufferMemory")(e));
        }

        self.set_name(vk::ObjectType::BUFFER, raw, desc.name.as_deref());
        Ok(VulkanBuffer { raw, allocation, size: desc.size })
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        unsafe { self.device().destroy_buffer(buffer.raw, None) };
        self.memory.free(buffer.allocation);
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mapped = Self::host_range(buffer, offset, data.len())?;
        unsafe { mapped.write(offset, data) };
        Ok(())
    }

    fn read_buffer(&self, buffer: &VulkanBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let mapped = Self::host_range(buffer, offset, out.len())?;
        unsafe { mapped.read(offset, out) };
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<VulkanTexture> {
        let (image_type, view_type, flags) = match desc.dimension {
            TextureDimension::D2 if desc.array_layers > 1 => {
                (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D_ARRAY, vk::ImageCreateFlags::empty())
            }
            TextureDimension::D2 => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D, vk::ImageCreateFlags::empty()),
            TextureDimension::D3 => (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D, vk::ImageCreateFlags::empty()),
            TextureDimension::Cube => {
                (vk::ImageType::TYPE_2D, vk::ImageViewType::CUBE, vk::ImageCreateFlags::CUBE_COMPATIBLE)
            }
        };
        let format = convert::format(desc.format);
        let aspect = convert::aspect(desc.format);
        let extent = vk::Extent3D { width: desc.width.max(1), height: desc.height.max(1), depth: desc.depth.max(1) };

        let (sharing, families) = self.sharing();
        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(image_type)
            .format(format)
            .extent(extent)
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(desc.array_layers.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::texture_usage(desc.usage))
            .sharing_mode(sharing)
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device().create_image(&info, None) }.map_err(vk_error("vkCreateImage"))?;

        let requirements = unsafe { self.device().get_image_memory_requirements(image) };
        let name = desc.name.as_deref().unwrap_or("texture");
        let allocation = match self.memory.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device().destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            self.device()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(vk_error("vkBindImageMemory"))
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::builder()
                        .image(image)
                        .view_type(view_type)
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: aspect,
                            base_mip_level: 0,
                            level_count: vk::REMAINING_MIP_LEVELS,
                            base_array_layer: 0,
                            layer_count: vk::REMAINING_ARRAY_LAYERS,
                        });
                    self.device()
                        .create_image_view(&view_info, None)
                        .map_err(vk_error("vkCreateImageView"))
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device().destroy_image(image, None) };
                self.memory.free(allocation);
                return Err(e);
            }
        };

        self.set_name(vk::ObjectType::IMAGE, image, desc.name.as_deref());
        Ok(VulkanTexture { image, allocation, view, aspect, extent })
    }

    fn destroy_texture(&self, texture: VulkanTexture) {
        unsafe {
            self.device().destroy_image_view(texture.view, None);
            self.device().destroy_image(texture.image, None);
        }
        self.memory.free(texture.allocation);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<VulkanSampler> {
        let info = vk::SamplerCreateInfo::builder()
            .min_filter(convert::filter(desc.min_filter))
            .mag_filter(convert::filter(desc.mag_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mip_filter))
            .address_mode_u(convert::address_mode(desc.address_u))
            .address_mode_v(convert::address_mode(desc.address_v))
            .address_mode_w(convert::address_mode(desc.address_w))
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(convert::compare_op).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let raw = unsafe { self.device().create_sampler(&info, None) }.map_err(vk_error("vkCreateSampler"))?;
        Ok(VulkanSampler { raw })
    }

    fn destroy_sampler(&self, sampler: VulkanSampler) {
        unsafe { self.device().destroy_sampler(sampler.raw, None) };
    }

    fn create_shader(&self, shader: &CompiledShader) -> Result<VulkanShader> {
        pipeline::create_shader(self, shader)
    }

    fn destroy_shader(&self, shader: VulkanShader) {
        for (_, module, _) in shader.modules {
            unsafe { self.device().destroy_shader_module(module, None) };
        }
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<VulkanPipelineLayout> {
        pipeline::create_pipeline_layout(self, desc)
    }

    fn destroy_pipeline_layout(&self, layout: VulkanPipelineLayout) {
        unsafe {
            self.device().destroy_pipeline_layout(layout.raw, None);
            for set_layout in layout.set_layouts {
                self.device().destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        shader: &VulkanShader,
        shader_info: &CompiledShader,
        layout: &VulkanPipelineLayout,
    ) -> Result<VulkanPipeline> {
        pipeline::create_graphics_pipeline(self, desc, shader, shader_info, layout)
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDesc,
        shader: &VulkanShader,
        _shader_info: &CompiledShader,
        layout: &VulkanPipelineLayout,
    ) -> Result<VulkanPipeline> {
        pipeline::create_compute_pipeline(self, shader, layout)
    }

    fn destroy_pipeline(&self, pipeline: VulkanPipeline) {
        unsafe { self.device().destroy_pipeline(pipeline.raw, None) };
    }

    fn create_descriptor_set(
        &self,
        layout: &VulkanPipelineLayout,
        set_index: u32,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<VulkanDescriptorSet> {
        pipeline::create_descriptor_set(self, layout, set_index, desc)
    }

    fn destroy_descriptor_set(&self, set: VulkanDescriptorSet) {
        // 销毁池会一并释放其中的描述符集
        unsafe { self.device().destroy_descriptor_pool(set.pool, None) };
    }

    fn write_descriptor_buffers(
        &self,
        set: &VulkanDescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[BufferWrite<'_, Self>],
    ) {
        pipeline::write_buffers(self, set, binding, first_element, writes);
    }

    fn write_descriptor_images(
        &self,
        set: &VulkanDescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[ImageWrite<'_, Self>],
    ) {
        pipeline::write_images(self, set, binding, first_element, writes);
    }

    fn create_swapchain(
        &self,
        window: RawWindowHandle,
        display: RawDisplayHandle,
        desc: &SwapchainDesc,
        present_queue: &VulkanQueue,
    ) -> Result<VulkanSwapchain> {
        swapchain::create(self, window, display, desc, present_queue)
    }

    fn resize_swapchain(&self, swapchain: &mut VulkanSwapchain, width: u32, height: u32) -> Result<()> {
        swapchain::resize(self, swapchain, width, height)
    }

    fn destroy_swapchain(&self, swapchain: VulkanSwapchain) {
        swapchain::destroy(self, swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: &mut VulkanSwapchain,
        signal: &VulkanSemaphore,
        timeout: Duration,
    ) -> Result<AcquireResult> {
        swapchain::acquire(self, swapchain, signal, timeout)
    }

    fn present(
        &self,
        queue: &VulkanQueue,
        swapchain: &VulkanSwapchain,
        image: u32,
        waits: &[&VulkanSemaphore],
    ) -> Result<PresentResult> {
        swapchain::present(self, queue, swapchain, image, waits)
    }
}

//! Metal 后端（metal-rs）
//!
//! - 只有一个队列族，族内队列数按需要声明，每条队列是独立的 `MTLCommandQueue`
//! - 时间线信号量是 `MTLSharedEvent`；二值信号量不需要原生对象，
//!   可绘制对象的获取与呈现由 `CAMetalLayer` 排序
//! - 命令列表先录制为操作序列，提交时编码进同一个 `MTLCommandBuffer`，
//!   前后分别编码事件等待与事件触发
//! - 主机可见的缓冲区使用共享存储，其余资源使用私有存储
//! - 着色器输入是 MSL 源码，创建时在线编译

mod convert;
mod encoder;
mod execute;
mod pipeline;
mod swapchain;

pub use encoder::MetalEncoder;
pub use pipeline::{MetalDescriptorSet, MetalPipeline, MetalPipelineLayout, PUSH_CONSTANT_BUFFER_INDEX, VERTEX_BUFFER_BASE};
pub use swapchain::MetalSwapchain;

use ::metal::*;
use objc::rc::autoreleasepool;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use self::execute::{Executor, Op};
use super::{
    AcquireResult, Backend, BufferWrite, CommandListLevel, EncodeContext, ImageWrite, PresentResult,
    SemaphoreKind, SubmitBatch, WaitStatus,
};
use crate::core::config::Config;
use crate::core::error::{DistRhiError, GraphicsError, Result};
use crate::core::sync::lock;
use crate::queue::{NativeQueueSlot, QueueFamilyDesc, QueueLayout};
use crate::resource::{
    BufferDesc, DescriptorBinding, DescriptorSetLayoutDesc, Format, MemoryLocation, PipelineLayoutDesc,
    SamplerDesc, TextureDesc, TextureDimension,
};
use crate::shader::{CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ShaderStage, ShaderTarget};
use crate::swapchain::SwapchainDesc;

const QUEUE_FAMILY: u32 = 0;

/// CPU 等待共享事件时的轮询间隔
const WAIT_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// 唯一的队列族：图形、计算、拷贝都可以
fn queue_families(extra_graphics: u32) -> [QueueFamilyDesc; 1] {
    [QueueFamilyDesc {
        index: QUEUE_FAMILY,
        graphics: true,
        compute: true,
        transfer: true,
        queue_count: 3 + extra_graphics,
    }]
}

fn resource_options(location: MemoryLocation) -> MTLResourceOptions {
    match location {
        MemoryLocation::GpuOnly => MTLResourceOptions::StorageModePrivate,
        MemoryLocation::CpuToGpu => {
            MTLResourceOptions::StorageModeShared | MTLResourceOptions::CPUCacheModeWriteCombined
        }
        MemoryLocation::GpuToCpu => MTLResourceOptions::StorageModeShared | MTLResourceOptions::CPUCacheModeDefaultCache,
    }
}

/// (纹理类型, 数组长度)
fn texture_type(desc: &TextureDesc) -> (MTLTextureType, u32) {
    let layers = desc.array_layers.max(1);
    match desc.dimension {
        TextureDimension::D2 if layers > 1 => (MTLTextureType::D2Array, layers),
        TextureDimension::D2 => (MTLTextureType::D2, 1),
        TextureDimension::D3 => (MTLTextureType::D3, 1),
        TextureDimension::Cube if layers > 6 => (MTLTextureType::CubeArray, layers / 6),
        TextureDimension::Cube => (MTLTextureType::Cube, 1),
    }
}

pub struct MetalQueue {
    raw: CommandQueue,
}

pub struct MetalSemaphore {
    /// 二值信号量为 `None`
    event: Option<SharedEvent>,
}

pub struct MetalBuffer {
    raw: Buffer,
    size: u64,
    location: MemoryLocation,
}

pub struct MetalTexture {
    raw: Texture,
    format: Format,
}

pub struct MetalSampler {
    raw: SamplerState,
}

pub struct MetalShader {
    /// 每个阶段一个库；函数引用库，二者一起保留
    functions: Vec<(ShaderStage, Library, Function)>,
}

pub struct MetalCommandList {
    level: CommandListLevel,
    ops: Vec<Op>,
}

macro_rules! objc_wrapper {
    ($($name:ident),* $(,)?) => {
        // Metal 对象可以跨线程使用，录制与提交由 Device 的锁串行化
        $(
            unsafe impl Send for $name {}
            unsafe impl Sync for $name {}
        )*
    };
}

objc_wrapper!(
    MetalQueue,
    MetalSemaphore,
    MetalBuffer,
    MetalTexture,
    MetalSampler,
    MetalShader,
    MetalPipeline,
    MetalDescriptorSet,
    MetalCommandList,
    MetalSwapchain,
);

/// Metal 后端
pub struct MetalBackend {
    device: Device,
    layout: QueueLayout,
    /// 已创建的队列，`wait_idle` 逐一排空
    queues: Mutex<Vec<CommandQueue>>,
}

objc_wrapper!(MetalBackend);

impl MetalBackend {
    fn host_range(buffer: &MetalBuffer, offset: u64, len: usize) -> Result<*mut u8> {
        if !buffer.location.is_host_visible() {
            return Err(DistRhiError::Runtime("buffer is not host visible".into()));
        }
        if offset.saturating_add(len as u64) > buffer.size {
            return Err(DistRhiError::Runtime(format!(
                "host access of {} bytes at offset {} exceeds buffer size {}",
                len, offset, buffer.size
            )));
        }
        Ok(buffer.raw.contents().cast::<u8>())
    }
}

impl Backend for MetalBackend {
    type Queue = MetalQueue;
    type Semaphore = MetalSemaphore;
    type Buffer = MetalBuffer;
    type Texture = MetalTexture;
    type Sampler = MetalSampler;
    type Shader = MetalShader;
    type PipelineLayout = MetalPipelineLayout;
    type Pipeline = MetalPipeline;
    type DescriptorSet = MetalDescriptorSet;
    type CommandList = MetalCommandList;
    type Swapchain = MetalSwapchain;
    type Encoder<'a> = MetalEncoder<'a>;

    const NAME: &'static str = "Metal";
    const SHADER_TARGET: ShaderTarget = ShaderTarget::Msl;

    fn new(config: &Config) -> Result<Self> {
        let device = Device::system_default()
            .ok_or_else(|| GraphicsError::DeviceCreation("no Metal device found".into()))?;
        if config.graphics.validation {
            debug!("Metal validation is controlled by MTL_DEBUG_LAYER, not by the config");
        }

        let layout = QueueLayout::select(
            &queue_families(config.graphics.max_extra_graphics_queues),
            config.graphics.max_extra_graphics_queues,
        )?;

        info!(device = %device.name(), "Metal backend initialized");
        Ok(Self { device, layout, queues: Mutex::new(Vec::new()) })
    }

    fn queue_layout(&self) -> &QueueLayout {
        &self.layout
    }

    fn native_queue(&self, slot: NativeQueueSlot) -> Result<MetalQueue> {
        if !self.layout.unique_slots().contains(&slot) {
            return Err(GraphicsError::DeviceCreation(format!("queue {:?} was not requested", slot)).into());
        }
        let raw = self.device.new_command_queue();
        lock(&self.queues).push(raw.clone());
        Ok(MetalQueue { raw })
    }

    fn wait_idle(&self) -> Result<()> {
        let queues = lock(&self.queues).clone();
        autoreleasepool(|| {
            for queue in &queues {
                // 同一队列上的命令缓冲区按提交顺序完成
                let command_buffer = queue.new_command_buffer();
                command_buffer.commit();
                command_buffer.wait_until_completed();
            }
        });
        Ok(())
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<MetalSemaphore> {
        match kind {
            SemaphoreKind::Timeline { initial } => {
                let event = self.device.new_shared_event();
                event.set_signaled_value(initial);
                Ok(MetalSemaphore { event: Some(event) })
            }
            SemaphoreKind::Binary => Ok(MetalSemaphore { event: None }),
        }
    }

    fn destroy_semaphore(&self, _semaphore: MetalSemaphore) {}

    fn semaphore_value(&self, semaphore: &MetalSemaphore) -> Result<u64> {
        let event = semaphore
            .event
            .as_ref()
            .ok_or_else(|| DistRhiError::Runtime("binary semaphores have no counter value".into()))?;
        Ok(event.signaled_value())
    }

    fn signal_semaphore(&self, semaphore: &MetalSemaphore, value: u64) -> Result<()> {
        if let Some(event) = &semaphore.event {
            event.set_signaled_value(value);
        }
        Ok(())
    }

    fn wait_semaphores(&self, waits: &[(&MetalSemaphore, u64)], timeout: Duration) -> Result<WaitStatus> {
        let pending: Vec<(&SharedEvent, u64)> = waits
            .iter()
            .filter_map(|(s, v)| s.event.as_ref().map(|e| (e, *v)))
            .collect();
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if pending.iter().all(|(event, value)| event.signaled_value() >= *value) {
                return Ok(WaitStatus::Ready);
            }
            let sleep = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(WaitStatus::Timeout);
                    }
                    remaining.min(WAIT_POLL_INTERVAL)
                }
                None => WAIT_POLL_INTERVAL,
            };
            std::thread::sleep(sleep);
        }
    }

    fn submit(&self, queue: &MetalQueue, batch: &SubmitBatch<'_, Self>) -> Result<()> {
        autoreleasepool(|| {
            let command_buffer = queue.raw.new_command_buffer();
            for wait in &batch.waits {
                if let Some(event) = &wait.semaphore.event {
                    command_buffer.encode_wait_for_event(event, wait.value);
                }
            }

            let mut executor = Executor::new(command_buffer);
            for list in &batch.command_lists {
                if list.level == CommandListLevel::Secondary {
                    warn!("Secondary command list submitted directly, skipped");
                    continue;
                }
                executor.reset_bindings();
                for op in &list.ops {
                    executor.execute(op);
                }
            }
            executor.finish();

            for signal in &batch.signals {
                if let Some(event) = &signal.semaphore.event {
                    command_buffer.encode_signal_event(event, signal.value);
                }
            }
            command_buffer.commit();
        });
        Ok(())
    }

    fn create_command_list(&self, _family: u32, level: CommandListLevel) -> Result<MetalCommandList> {
        Ok(MetalCommandList { level, ops: Vec::new() })
    }

    fn destroy_command_list(&self, _list: MetalCommandList) {}

    fn begin_encoding<'a>(
        &'a self,
        list: &'a mut MetalCommandList,
        ctx: EncodeContext<'a, Self>,
    ) -> Result<MetalEncoder<'a>> {
        Ok(MetalEncoder::new(self, &mut list.ops, ctx))
    }

    fn end_encoding<'a>(&'a self, encoder: MetalEncoder<'a>) -> Result<Vec<MetalBuffer>> {
        encoder.finish()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<MetalBuffer> {
        let raw = self.device.new_buffer(desc.size.max(1), resource_options(desc.memory));
        if let Some(name) = &desc.name {
            raw.set_label(name);
        }
        Ok(MetalBuffer { raw, size: desc.size, location: desc.memory })
    }

    fn destroy_buffer(&self, _buffer: MetalBuffer) {}

    fn write_buffer(&self, buffer: &MetalBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = Self::host_range(buffer, offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &MetalBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = Self::host_range(buffer, offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<MetalTexture> {
        let pixel_format = convert::pixel_format(desc.format);
        if pixel_format == MTLPixelFormat::Invalid {
            return Err(GraphicsError::ResourceCreation(format!("{:?} is not a Metal texture format", desc.format)).into());
        }
        let (ty, array_length) = texture_type(desc);

        let descriptor = TextureDescriptor::new();
        descriptor.set_texture_type(ty);
        descriptor.set_pixel_format(pixel_format);
        descriptor.set_width(u64::from(desc.width.max(1)));
        descriptor.set_height(u64::from(desc.height.max(1)));
        descriptor.set_depth(if ty == MTLTextureType::D3 { u64::from(desc.depth.max(1)) } else { 1 });
        descriptor.set_mipmap_level_count(u64::from(desc.mip_levels.max(1)));
        descriptor.set_array_length(u64::from(array_length));
        descriptor.set_usage(convert::texture_usage(desc.usage));
        descriptor.set_storage_mode(MTLStorageMode::Private);

        let raw = self.device.new_texture(&descriptor);
        if let Some(name) = &desc.name {
            raw.set_label(name);
        }
        Ok(MetalTexture { raw, format: desc.format })
    }

    fn destroy_texture(&self, _texture: MetalTexture) {}

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<MetalSampler> {
        let descriptor = SamplerDescriptor::new();
        descriptor.set_min_filter(convert::min_mag_filter(desc.min_filter));
        descriptor.set_mag_filter(convert::min_mag_filter(desc.mag_filter));
        descriptor.set_mip_filter(convert::mip_filter(desc.mip_filter));
        descriptor.set_address_mode_s(convert::address_mode(desc.address_u));
        descriptor.set_address_mode_t(convert::address_mode(desc.address_v));
        descriptor.set_address_mode_r(convert::address_mode(desc.address_w));
        if let Some(anisotropy) = desc.max_anisotropy {
            descriptor.set_max_anisotropy(anisotropy.clamp(1.0, 16.0) as u64);
        }
        if let Some(compare) = desc.compare {
            descriptor.set_compare_function(convert::compare(compare));
        }
        Ok(MetalSampler { raw: self.device.new_sampler(&descriptor) })
    }

    fn destroy_sampler(&self, _sampler: MetalSampler) {}

    fn create_shader(&self, shader: &CompiledShader) -> Result<MetalShader> {
        let options = CompileOptions::new();
        let mut functions = Vec::with_capacity(shader.stages.len());
        for stage in &shader.stages {
            let source = std::str::from_utf8(&stage.code)
                .map_err(|e| GraphicsError::ShaderCompilation(format!("{:?} stage is not MSL source: {}", stage.stage, e)))?;
            let library = self
                .device
                .new_library_with_source(source, &options)
                .map_err(|e| GraphicsError::ShaderCompilation(format!("{:?} stage: {}", stage.stage, e)))?;
            let function = library.get_function(&stage.entry_point, None).map_err(|e| {
                GraphicsError::ShaderCompilation(format!("entry point '{}' not found: {}", stage.entry_point, e))
            })?;
            functions.push((stage.stage, library, function));
        }
        Ok(MetalShader { functions })
    }

    fn destroy_shader(&self, _shader: MetalShader) {}

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<MetalPipelineLayout> {
        pipeline::create_pipeline_layout(desc)
    }

    fn destroy_pipeline_layout(&self, _layout: MetalPipelineLayout) {}

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        shader: &MetalShader,
        shader_info: &CompiledShader,
        _layout: &MetalPipelineLayout,
    ) -> Result<MetalPipeline> {
        pipeline::create_graphics_pipeline(&self.device, desc, shader, shader_info)
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDesc,
        shader: &MetalShader,
        shader_info: &CompiledShader,
        _layout: &MetalPipelineLayout,
    ) -> Result<MetalPipeline> {
        pipeline::create_compute_pipeline(&self.device, shader, shader_info)
    }

    fn destroy_pipeline(&self, _pipeline: MetalPipeline) {}

    fn create_descriptor_set(
        &self,
        layout: &MetalPipelineLayout,
        set_index: u32,
        _desc: &DescriptorSetLayoutDesc,
    ) -> Result<MetalDescriptorSet> {
        let plan = layout
            .sets
            .get(set_index as usize)
            .cloned()
            .ok_or_else(|| GraphicsError::ResourceCreation(format!("pipeline layout has no set {}", set_index)))?;
        Ok(MetalDescriptorSet::new(plan))
    }

    fn destroy_descriptor_set(&self, _set: MetalDescriptorSet) {}

    fn write_descriptor_buffers(
        &self,
        set: &MetalDescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[BufferWrite<'_, Self>],
    ) {
        pipeline::write_buffers(set, binding, first_element, writes);
    }

    fn write_descriptor_images(
        &self,
        set: &MetalDescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[ImageWrite<'_, Self>],
    ) {
        pipeline::write_images(set, binding, first_element, writes);
    }

    fn create_swapchain(
        &self,
        window: RawWindowHandle,
        _display: RawDisplayHandle,
        desc: &SwapchainDesc,
        present_queue: &MetalQueue,
    ) -> Result<MetalSwapchain> {
        swapchain::create(self, window, desc, present_queue)
    }

    fn resize_swapchain(&self, swapchain: &mut MetalSwapchain, width: u32, height: u32) -> Result<()> {
        swapchain::resize(swapchain, width, height);
        Ok(())
    }

    fn destroy_swapchain(&self, _swapchain: MetalSwapchain) {}

    fn acquire_next_image(
        &self,
        swapchain: &mut MetalSwapchain,
        _signal: &MetalSemaphore,
        _timeout: Duration,
    ) -> Result<AcquireResult> {
        Ok(swapchain::acquire(swapchain))
    }

    fn present(
        &self,
        queue: &MetalQueue,
        swapchain: &MetalSwapchain,
        image: u32,
        _waits: &[&MetalSemaphore],
    ) -> Result<PresentResult> {
        swapchain::present(queue, swapchain, image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::TextureUsage;

    #[test]
    fn test_single_family_shares_queues() {
        let layout = QueueLayout::select(&queue_families(1), 1).unwrap();
        assert_eq!(layout.graphics.family, QUEUE_FAMILY);
        assert_eq!(layout.transfer.family, QUEUE_FAMILY);
        assert_ne!(layout.transfer.index, layout.graphics.index);
        assert_eq!(layout.capabilities.extra_graphics_queues, 1);
    }

    #[test]
    fn test_texture_type_selection() {
        let mut desc = TextureDesc::new_2d(16, 16, Format::Rgba8Unorm, TextureUsage::SAMPLED);
        assert_eq!(texture_type(&desc), (MTLTextureType::D2, 1));
        desc.array_layers = 4;
        assert_eq!(texture_type(&desc), (MTLTextureType::D2Array, 4));
        desc.dimension = TextureDimension::Cube;
        desc.array_layers = 12;
        assert_eq!(texture_type(&desc), (MTLTextureType::CubeArray, 2));
    }
}

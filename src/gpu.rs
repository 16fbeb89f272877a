//! 运行期后端选择
//!
//! `Gpu` 是封闭的后端枚举：每个编译进来的后端对应一个变体，
//! 方法通过 `match` 转发到对应的 `Device<B>`。需要静态分发时直接使用 `Device<B>`。

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::time::Duration;
use tracing::info;

use crate::backend::null::NullBackend;
use crate::backend::WaitStatus;
use crate::command::{CommandStream, CommandStreamDesc};
use crate::core::config::{Config, GraphicsBackend};
use crate::core::error::{DistRhiError, Result};
use crate::device::Device;
use crate::handle::*;
use crate::queue::{QueueCapabilities, QueueProgress, QueueType, SubmitDesc};
use crate::resource::{
    BufferBinding, BufferDesc, ImageBinding, PipelineLayoutDesc, SamplerDesc, TextureDesc,
};
use crate::shader::{
    CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ReflectionLayout, ShaderCompiler, ShaderDesc,
    ShaderTarget,
};
use crate::swapchain::{PresentDesc, SwapchainDesc};

#[cfg(all(target_os = "windows", feature = "dx12"))]
use crate::backend::dx12::Dx12Backend;
#[cfg(all(target_os = "macos", feature = "metal"))]
use crate::backend::metal::MetalBackend;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::VulkanBackend;

/// 运行期选择的图形设备
pub enum Gpu {
    Null(Device<NullBackend>),
    #[cfg(feature = "vulkan")]
    Vulkan(Device<VulkanBackend>),
    #[cfg(all(target_os = "windows", feature = "dx12"))]
    Dx12(Device<Dx12Backend>),
    #[cfg(all(target_os = "macos", feature = "metal"))]
    Metal(Device<MetalBackend>),
}

macro_rules! dispatch {
    ($self:expr, $device:ident => $body:expr) => {
        match $self {
            Gpu::Null($device) => $body,
            #[cfg(feature = "vulkan")]
            Gpu::Vulkan($device) => $body,
            #[cfg(all(target_os = "windows", feature = "dx12"))]
            Gpu::Dx12($device) => $body,
            #[cfg(all(target_os = "macos", feature = "metal"))]
            Gpu::Metal($device) => $body,
        }
    };
}

fn not_compiled(backend: GraphicsBackend) -> DistRhiError {
    DistRhiError::Initialization(format!(
        "{} backend is not compiled into this build",
        backend.name()
    ))
}

impl Gpu {
    /// 按配置创建设备
    ///
    /// # 参数
    ///
    /// * `config` - 运行配置，`graphics.backend` 决定使用哪个后端
    ///
    /// # 返回值
    ///
    /// 请求的后端未编译进当前构建（缺少 feature 或平台不支持）时返回 `Initialization` 错误
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use dist_rhi::core::Config;
    /// use dist_rhi::Gpu;
    ///
    /// let mut config = Config::default();
    /// config.apply_args(std::env::args());
    /// let gpu = Gpu::new(&config).unwrap();
    /// println!("using {}", gpu.backend_name());
    /// ```
    pub fn new(config: &Config) -> Result<Self> {
        let backend = config.graphics.backend;
        info!(backend = backend.name(), "Selecting graphics backend");

        match backend {
            GraphicsBackend::Null => Ok(Gpu::Null(Device::new(config)?)),
            #[cfg(feature = "vulkan")]
            GraphicsBackend::Vulkan => Ok(Gpu::Vulkan(Device::new(config)?)),
            #[cfg(all(target_os = "windows", feature = "dx12"))]
            GraphicsBackend::Dx12 => Ok(Gpu::Dx12(Device::new(config)?)),
            #[cfg(all(target_os = "macos", feature = "metal"))]
            GraphicsBackend::Metal => Ok(Gpu::Metal(Device::new(config)?)),
            #[allow(unreachable_patterns)]
            other => Err(not_compiled(other)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        dispatch!(self, d => d.backend_name())
    }

    /// 后端期望的着色器二进制格式
    pub fn shader_target(&self) -> ShaderTarget {
        use crate::backend::Backend;
        match self {
            Gpu::Null(_) => NullBackend::SHADER_TARGET,
            #[cfg(feature = "vulkan")]
            Gpu::Vulkan(_) => VulkanBackend::SHADER_TARGET,
            #[cfg(all(target_os = "windows", feature = "dx12"))]
            Gpu::Dx12(_) => Dx12Backend::SHADER_TARGET,
            #[cfg(all(target_os = "macos", feature = "metal"))]
            Gpu::Metal(_) => MetalBackend::SHADER_TARGET,
        }
    }

    pub fn config(&self) -> &Config {
        dispatch!(self, d => d.config())
    }

    pub fn frame_index(&self) -> usize {
        dispatch!(self, d => d.frame_index())
    }

    pub fn total_frames(&self) -> u64 {
        dispatch!(self, d => d.total_frames())
    }

    // 帧生命周期

    pub fn start_frame(&self) -> Result<()> {
        dispatch!(self, d => d.start_frame())
    }

    pub fn end_frame(&self) {
        dispatch!(self, d => d.end_frame())
    }

    pub fn join(&self) -> Result<()> {
        dispatch!(self, d => d.join())
    }

    // 队列

    pub fn primary_queue(&self, ty: QueueType) -> QueueHandle {
        dispatch!(self, d => d.primary_queue(ty))
    }

    pub fn create_queue(&self, ty: QueueType) -> Result<QueueHandle> {
        dispatch!(self, d => d.create_queue(ty))
    }

    pub fn destroy_queue(&self, handle: QueueHandle) {
        dispatch!(self, d => d.destroy_queue(handle))
    }

    pub fn queue_capabilities(&self) -> QueueCapabilities {
        dispatch!(self, d => d.queue_capabilities())
    }

    pub fn queue_progress(&self, handle: QueueHandle) -> Result<QueueProgress> {
        dispatch!(self, d => d.queue_progress(handle))
    }

    pub fn submit(&self, desc: &SubmitDesc) -> Result<()> {
        dispatch!(self, d => d.submit(desc))
    }

    pub fn present(&self, desc: &PresentDesc) -> Result<()> {
        dispatch!(self, d => d.present(desc))
    }

    // 命令流

    pub fn create_command_stream(&self, desc: &CommandStreamDesc) -> Result<CommandStream> {
        dispatch!(self, d => d.create_command_stream(desc))
    }

    pub fn destroy_command_stream(&self, stream: CommandStream) {
        dispatch!(self, d => d.destroy_command_stream(stream))
    }

    pub fn close_command_streams(&self, streams: &[&CommandStream]) -> Result<()> {
        dispatch!(self, d => d.close_command_streams(streams))
    }

    // 信号量

    pub fn create_semaphore(&self, initial: u64) -> Result<SemaphoreHandle> {
        dispatch!(self, d => d.create_semaphore(initial))
    }

    pub fn destroy_semaphore(&self, handle: SemaphoreHandle) {
        dispatch!(self, d => d.destroy_semaphore(handle))
    }

    pub fn signal_semaphore(&self, handle: SemaphoreHandle, value: u64) -> Result<()> {
        dispatch!(self, d => d.signal_semaphore(handle, value))
    }

    pub fn semaphore_value(&self, handle: SemaphoreHandle) -> Result<u64> {
        dispatch!(self, d => d.semaphore_value(handle))
    }

    pub fn wait_semaphore(&self, handle: SemaphoreHandle, value: u64, timeout: Duration) -> Result<WaitStatus> {
        dispatch!(self, d => d.wait_semaphore(handle, value, timeout))
    }

    // 资源

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        dispatch!(self, d => d.create_buffer(desc))
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) {
        dispatch!(self, d => d.destroy_buffer(handle))
    }

    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        dispatch!(self, d => d.write_buffer(handle, offset, data))
    }

    pub fn read_buffer(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        dispatch!(self, d => d.read_buffer(handle, offset, out))
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        dispatch!(self, d => d.create_texture(desc))
    }

    pub fn destroy_texture(&self, handle: TextureHandle) {
        dispatch!(self, d => d.destroy_texture(handle))
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        dispatch!(self, d => d.create_sampler(desc))
    }

    pub fn destroy_sampler(&self, handle: SamplerHandle) {
        dispatch!(self, d => d.destroy_sampler(handle))
    }

    pub fn compile_shader(&self, compiler: &dyn ShaderCompiler, desc: &ShaderDesc) -> Result<ShaderHandle> {
        dispatch!(self, d => d.compile_shader(compiler, desc))
    }

    pub fn create_shader(&self, compiled: CompiledShader) -> Result<ShaderHandle> {
        dispatch!(self, d => d.create_shader(compiled))
    }

    pub fn destroy_shader(&self, handle: ShaderHandle) {
        dispatch!(self, d => d.destroy_shader(handle))
    }

    pub fn shader_reflection(&self, handle: ShaderHandle) -> Option<ReflectionLayout> {
        dispatch!(self, d => d.shader_reflection(handle))
    }

    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<PipelineLayoutHandle> {
        dispatch!(self, d => d.create_pipeline_layout(desc))
    }

    pub fn create_pipeline_layout_from_shader(&self, shader: ShaderHandle) -> Result<PipelineLayoutHandle> {
        dispatch!(self, d => d.create_pipeline_layout_from_shader(shader))
    }

    pub fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle) {
        dispatch!(self, d => d.destroy_pipeline_layout(handle))
    }

    pub fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle> {
        dispatch!(self, d => d.create_graphics_pipeline(desc))
    }

    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        dispatch!(self, d => d.create_compute_pipeline(desc))
    }

    pub fn destroy_pipeline(&self, handle: PipelineHandle) {
        dispatch!(self, d => d.destroy_pipeline(handle))
    }

    pub fn create_descriptor_set(&self, layout: PipelineLayoutHandle, set_index: u32) -> Result<DescriptorSetHandle> {
        dispatch!(self, d => d.create_descriptor_set(layout, set_index))
    }

    pub fn destroy_descriptor_set(&self, handle: DescriptorSetHandle) {
        dispatch!(self, d => d.destroy_descriptor_set(handle))
    }

    pub fn update_descriptor_buffers(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        first_element: u32,
        buffers: &[BufferBinding],
    ) -> Result<()> {
        dispatch!(self, d => d.update_descriptor_buffers(set, binding, first_element, buffers))
    }

    pub fn update_descriptor_images(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        first_element: u32,
        images: &[ImageBinding],
    ) -> Result<()> {
        dispatch!(self, d => d.update_descriptor_images(set, binding, first_element, images))
    }

    // 交换链

    pub fn create_swapchain<W>(&self, window: &W, desc: &SwapchainDesc) -> Result<SwapchainHandle>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        dispatch!(self, d => d.create_swapchain(window, desc))
    }

    pub fn resize_swapchain(&self, handle: SwapchainHandle, width: u32, height: u32) -> Result<()> {
        dispatch!(self, d => d.resize_swapchain(handle, width, height))
    }

    pub fn set_swapchain_active(&self, handle: SwapchainHandle, active: bool) {
        dispatch!(self, d => d.set_swapchain_active(handle, active))
    }

    pub fn swapchain_texture(&self, handle: SwapchainHandle) -> TextureHandle {
        dispatch!(self, d => d.swapchain_texture(handle))
    }

    pub fn swapchain_desc(&self, handle: SwapchainHandle) -> Option<SwapchainDesc> {
        dispatch!(self, d => d.swapchain_desc(handle))
    }

    pub fn destroy_swapchain(&self, handle: SwapchainHandle) {
        dispatch!(self, d => d.destroy_swapchain(handle))
    }
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu").field("backend", &self.backend_name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_backend_is_always_available() {
        let mut config = Config::default();
        config.graphics.backend = GraphicsBackend::Null;
        let gpu = Gpu::new(&config).unwrap();
        assert_eq!(gpu.backend_name(), "null");
        assert_eq!(gpu.shader_target(), ShaderTarget::Any);
    }

    #[cfg(not(all(target_os = "windows", feature = "dx12")))]
    #[test]
    fn test_disabled_backend_reports_initialization_error() {
        let mut config = Config::default();
        config.graphics.backend = GraphicsBackend::Dx12;
        match Gpu::new(&config) {
            Err(DistRhiError::Initialization(msg)) => assert!(msg.contains("DirectX 12")),
            other => panic!("unexpected result: {:?}", other.map(|g| g.backend_name())),
        }
    }
}

//! 后端接口
//!
//! `Backend` 只暴露原生原语：队列、信号量、命令列表、资源、交换链。
//! 帧生命周期、提交排序、句柄表等逻辑全部在 `Device<B>` 中实现，
//! 各后端之间共享。
//!
//! 后端集合在编译期固定：
//!
//! - `null`：始终编译，无 GPU 的模拟实现，用于无窗口环境与测试
//! - `vulkan`：`vulkan` feature（默认开启）
//! - `dx12`：`dx12` feature，仅 Windows
//! - `metal`：`metal` feature，仅 macOS

pub mod null;

#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(all(target_os = "windows", feature = "dx12"))]
pub mod dx12;

#[cfg(all(target_os = "macos", feature = "metal"))]
pub mod metal;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::time::Duration;

use crate::command::CommandEncoder;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::device::tables::{Resources, TextureEntry};
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, HandleTable, PipelineHandle,
    PipelineLayoutHandle, SwapchainHandle, TextureHandle,
};
use crate::queue::{NativeQueueSlot, QueueLayout, WaitStage};
use crate::resource::{
    BufferDesc, DescriptorBinding, DescriptorSetLayoutDesc, Format, PipelineLayoutDesc, SamplerDesc,
    TextureDesc,
};
use crate::shader::{CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ShaderTarget};
use crate::swapchain::{SwapchainDesc, SwapchainEntry};
use crate::command::PipelineBindPoint;

/// 信号量种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    /// 时间线信号量（单调递增的整数值）
    Timeline { initial: u64 },
    /// 二值信号量（仅用于交换链获取 / 呈现）
    Binary,
}

/// CPU 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    Timeout,
}

/// 交换链图像获取结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired(u32),
    Suboptimal(u32),
    OutOfDate,
    Timeout,
}

/// 呈现结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// 命令列表级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListLevel {
    Primary,
    Secondary,
}

/// 提交中的一个信号量操作
pub struct SemaphoreSubmit<'a, B: Backend> {
    pub semaphore: &'a B::Semaphore,
    /// 时间线值；二值信号量忽略（填 0）
    pub value: u64,
    pub stage: WaitStage,
}

/// 一次原生提交的全部内容
pub struct SubmitBatch<'a, B: Backend> {
    pub command_lists: Vec<&'a B::CommandList>,
    pub waits: Vec<SemaphoreSubmit<'a, B>>,
    pub signals: Vec<SemaphoreSubmit<'a, B>>,
}

/// 缓冲区描述符写入
pub struct BufferWrite<'a, B: Backend> {
    pub buffer: &'a B::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// 图像 / 采样器描述符写入
pub struct ImageWrite<'a, B: Backend> {
    pub texture: Option<&'a B::Texture>,
    pub sampler: Option<&'a B::Sampler>,
}

/// 编码时解析出的纹理
pub enum TextureRef<'a, B: Backend> {
    Native(&'a B::Texture),
    /// 交换链代理纹理，指向本帧获取到的图像
    Swapchain { swapchain: &'a B::Swapchain, image: u32 },
}

impl<B: Backend> Clone for TextureRef<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for TextureRef<'_, B> {}

/// 纹理的基本信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub mip_levels: u32,
    pub array_layers: u32,
}

/// 编码阶段的只读上下文
///
/// 把命令中的句柄解析为原生对象。解析失败时后端记录错误并跳过该命令。
pub struct EncodeContext<'a, B: Backend> {
    pub(crate) resources: &'a Resources<B>,
    pub(crate) swapchains: &'a HandleTable<SwapchainHandle, SwapchainEntry<B>>,
    pub(crate) secondaries: &'a [(CommandStreamHandle, &'a B::CommandList)],
    pub(crate) touched_swapchains: &'a [SwapchainHandle],
    pub(crate) frame: u64,
    pub(crate) level: CommandListLevel,
}

impl<'a, B: Backend> EncodeContext<'a, B> {
    pub fn buffer(&self, handle: BufferHandle) -> Option<&'a B::Buffer> {
        self.resources.buffers.get(handle).map(|e| &e.native)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<TextureRef<'a, B>> {
        match self.resources.textures.get(handle)? {
            TextureEntry::Native { native, .. } => Some(TextureRef::Native(native)),
            TextureEntry::Swapchain(sc) => {
                let entry = self.swapchains.get(*sc)?;
                let image = entry.current_image?;
                Some(TextureRef::Swapchain { swapchain: &entry.native, image })
            }
        }
    }

    pub fn texture_info(&self, handle: TextureHandle) -> Option<TextureInfo> {
        match self.resources.textures.get(handle)? {
            TextureEntry::Native { desc, .. } => Some(TextureInfo {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
            }),
            TextureEntry::Swapchain(sc) => {
                let desc = &self.swapchains.get(*sc)?.desc;
                Some(TextureInfo {
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    mip_levels: 1,
                    array_layers: 1,
                })
            }
        }
    }

    pub fn pipeline(&self, handle: PipelineHandle) -> Option<(&'a B::Pipeline, PipelineBindPoint)> {
        self.resources.pipelines.get(handle).map(|e| (&e.native, e.bind_point))
    }

    pub fn pipeline_layout(&self, handle: PipelineLayoutHandle) -> Option<&'a B::PipelineLayout> {
        self.resources.pipeline_layouts.get(handle).map(|e| &e.native)
    }

    pub fn descriptor_set(&self, handle: DescriptorSetHandle) -> Option<&'a B::DescriptorSet> {
        self.resources.descriptor_sets.get(handle).map(|e| &e.native)
    }

    /// 已关闭的二级命令列表
    pub fn secondary(&self, handle: CommandStreamHandle) -> Option<&'a B::CommandList> {
        self.secondaries
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, list)| *list)
    }

    /// 本命令流写入的交换链，以及它们本帧获取到的图像
    pub fn touched_swapchains(&self) -> impl Iterator<Item = (&'a B::Swapchain, u32)> + '_ {
        self.touched_swapchains.iter().filter_map(|h| {
            let entry = self.swapchains.get(*h)?;
            Some((&entry.native, entry.current_image?))
        })
    }

    /// 总帧计数（用于给暂存资源打标签）
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn level(&self) -> CommandListLevel {
        self.level
    }
}

/// 图形后端
pub trait Backend: Sized + Send + Sync + 'static {
    type Queue: Send + Sync;
    type Semaphore: Send + Sync;
    type Buffer: Send + Sync;
    type Texture: Send + Sync;
    type Sampler: Send + Sync;
    type Shader: Send + Sync;
    type PipelineLayout: Send + Sync;
    type Pipeline: Send + Sync;
    type DescriptorSet: Send + Sync;
    type CommandList: Send + Sync;
    type Swapchain: Send + Sync;
    type Encoder<'a>: CommandEncoder
    where
        Self: 'a;

    const NAME: &'static str;
    const SHADER_TARGET: ShaderTarget;

    /// 创建实例与逻辑设备，并按 `QueueLayout::select` 申请硬件队列
    fn new(config: &Config) -> Result<Self>;

    fn queue_layout(&self) -> &QueueLayout;

    /// 取得一条在初始化时申请过的硬件队列
    fn native_queue(&self, slot: NativeQueueSlot) -> Result<Self::Queue>;

    fn wait_idle(&self) -> Result<()>;

    // ---- 同步 ----

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);
    fn semaphore_value(&self, semaphore: &Self::Semaphore) -> Result<u64>;
    fn signal_semaphore(&self, semaphore: &Self::Semaphore, value: u64) -> Result<()>;
    fn wait_semaphores(&self, waits: &[(&Self::Semaphore, u64)], timeout: Duration) -> Result<WaitStatus>;

    /// 一次原生提交
    fn submit(&self, queue: &Self::Queue, batch: &SubmitBatch<'_, Self>) -> Result<()>;

    // ---- 命令列表 ----

    fn create_command_list(&self, family: u32, level: CommandListLevel) -> Result<Self::CommandList>;
    fn destroy_command_list(&self, list: Self::CommandList);

    /// 重置命令列表并开始录制
    fn begin_encoding<'a>(
        &'a self,
        list: &'a mut Self::CommandList,
        ctx: EncodeContext<'a, Self>,
    ) -> Result<Self::Encoder<'a>>;

    /// 结束录制，返回编码过程中创建的暂存缓冲区
    fn end_encoding<'a>(&'a self, encoder: Self::Encoder<'a>) -> Result<Vec<Self::Buffer>>;

    // ---- 资源 ----

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, buffer: &Self::Buffer, offset: u64, out: &mut [u8]) -> Result<()>;

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture>;
    fn destroy_texture(&self, texture: Self::Texture);

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Self::Sampler>;
    fn destroy_sampler(&self, sampler: Self::Sampler);

    fn create_shader(&self, shader: &CompiledShader) -> Result<Self::Shader>;
    fn destroy_shader(&self, shader: Self::Shader);

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<Self::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: Self::PipelineLayout);

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        shader: &Self::Shader,
        shader_info: &CompiledShader,
        layout: &Self::PipelineLayout,
    ) -> Result<Self::Pipeline>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        shader: &Self::Shader,
        shader_info: &CompiledShader,
        layout: &Self::PipelineLayout,
    ) -> Result<Self::Pipeline>;
    fn destroy_pipeline(&self, pipeline: Self::Pipeline);

    fn create_descriptor_set(
        &self,
        layout: &Self::PipelineLayout,
        set_index: u32,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<Self::DescriptorSet>;
    fn destroy_descriptor_set(&self, set: Self::DescriptorSet);

    /// 写入已通过校验的缓冲区描述符
    fn write_descriptor_buffers(
        &self,
        set: &Self::DescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[BufferWrite<'_, Self>],
    );

    /// 写入已通过校验的图像 / 采样器描述符
    fn write_descriptor_images(
        &self,
        set: &Self::DescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[ImageWrite<'_, Self>],
    );

    // ---- 交换链 ----

    fn create_swapchain(
        &self,
        window: RawWindowHandle,
        display: RawDisplayHandle,
        desc: &SwapchainDesc,
        present_queue: &Self::Queue,
    ) -> Result<Self::Swapchain>;
    fn resize_swapchain(&self, swapchain: &mut Self::Swapchain, width: u32, height: u32) -> Result<()>;
    fn destroy_swapchain(&self, swapchain: Self::Swapchain);

    /// 获取下一张可用图像，并在图像可写时触发 `signal`
    fn acquire_next_image(
        &self,
        swapchain: &mut Self::Swapchain,
        signal: &Self::Semaphore,
        timeout: Duration,
    ) -> Result<AcquireResult>;

    fn present(
        &self,
        queue: &Self::Queue,
        swapchain: &Self::Swapchain,
        image: u32,
        waits: &[&Self::Semaphore],
    ) -> Result<PresentResult>;
}

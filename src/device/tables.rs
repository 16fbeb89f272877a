//! 设备持有的对象表
//!
//! 每类对象一张句柄表，表项保存原生对象以及后续校验需要的元数据。

use crate::backend::Backend;
use crate::command::PipelineBindPoint;
use crate::handle::{
    BufferHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle, SamplerHandle,
    ShaderHandle, SwapchainHandle, TextureHandle, HandleTable,
};
use crate::resource::{BufferDesc, DescriptorSetState, PipelineLayoutDesc, TextureDesc};
use crate::shader::CompiledShader;

pub(crate) struct BufferEntry<B: Backend> {
    pub native: B::Buffer,
    pub desc: BufferDesc,
}

pub(crate) enum TextureEntry<B: Backend> {
    Native { native: B::Texture, desc: TextureDesc },
    /// 交换链代理纹理
    Swapchain(SwapchainHandle),
}

pub(crate) struct ShaderEntry<B: Backend> {
    pub native: B::Shader,
    /// 编译结果（含反射布局），创建管线时使用
    pub compiled: CompiledShader,
}

pub(crate) struct PipelineLayoutEntry<B: Backend> {
    pub native: B::PipelineLayout,
    pub desc: PipelineLayoutDesc,
}

pub(crate) struct PipelineEntry<B: Backend> {
    pub native: B::Pipeline,
    pub bind_point: PipelineBindPoint,
}

pub(crate) struct DescriptorSetEntry<B: Backend> {
    pub native: B::DescriptorSet,
    pub state: DescriptorSetState,
}

/// 资源类对象表
pub(crate) struct Resources<B: Backend> {
    pub buffers: HandleTable<BufferHandle, BufferEntry<B>>,
    pub textures: HandleTable<TextureHandle, TextureEntry<B>>,
    pub samplers: HandleTable<SamplerHandle, B::Sampler>,
    pub shaders: HandleTable<ShaderHandle, ShaderEntry<B>>,
    pub pipeline_layouts: HandleTable<PipelineLayoutHandle, PipelineLayoutEntry<B>>,
    pub pipelines: HandleTable<PipelineHandle, PipelineEntry<B>>,
    pub descriptor_sets: HandleTable<DescriptorSetHandle, DescriptorSetEntry<B>>,
}

impl<B: Backend> Resources<B> {
    pub fn new() -> Self {
        Self {
            buffers: HandleTable::new(256),
            textures: HandleTable::new(256),
            samplers: HandleTable::new(32),
            shaders: HandleTable::new(64),
            pipeline_layouts: HandleTable::new(64),
            pipelines: HandleTable::new(64),
            descriptor_sets: HandleTable::new(128),
        }
    }
}

//! Metal 管线、管线布局与描述符集
//!
//! Metal 没有描述符集，绑定直接落在编码器的参数表上。布局把每个 set 的绑定
//! 依次编号到三张表：
//!
//! - 缓冲区：`[0, PUSH_CONSTANT_BUFFER_INDEX)`
//! - 纹理、采样器：各自从 0 开始，跨 set 连续编号
//!
//! 推送常量固定在缓冲区下标 [`PUSH_CONSTANT_BUFFER_INDEX`]，顶点缓冲绑定点 b
//! 位于 `VERTEX_BUFFER_BASE + b`。

use ::metal::*;
use std::sync::Mutex;
use tracing::debug;

use super::{convert, MetalBackend, MetalShader};
use crate::backend::{BufferWrite, ImageWrite};
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::lock;
use crate::resource::{DescriptorBinding, DescriptorSetLayoutDesc, DescriptorType, PipelineLayoutDesc};
use crate::shader::{CompiledShader, GraphicsPipelineDesc, ShaderStage, ShaderStages};

/// 推送常量所在的缓冲区下标
pub const PUSH_CONSTANT_BUFFER_INDEX: u64 = 15;
/// 顶点缓冲绑定点 0 对应的缓冲区下标
pub const VERTEX_BUFFER_BASE: u64 = 16;
/// Metal 单个阶段的缓冲区参数上限
const MAX_BUFFER_ARGUMENTS: u64 = 31;
const MAX_TEXTURE_ARGUMENTS: u32 = 128;
const MAX_SAMPLER_ARGUMENTS: u32 = 16;

/// 一个绑定点在参数表中的起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BindingSlot {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
    pub buffer_index: Option<u32>,
    pub texture_index: Option<u32>,
    pub sampler_index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct SetPlan {
    pub bindings: Vec<BindingSlot>,
    pub buffer_base: u32,
    pub buffer_count: u32,
    pub texture_base: u32,
    pub texture_count: u32,
    pub sampler_base: u32,
    pub sampler_count: u32,
}

impl SetPlan {
    pub fn slot(&self, binding: u32) -> Option<&BindingSlot> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

/// 为全部 set 分配参数表位置
pub(super) fn plan_sets(sets: &[DescriptorSetLayoutDesc]) -> Result<Vec<SetPlan>> {
    let (mut buffers, mut textures, mut samplers) = (0u32, 0u32, 0u32);
    let mut plans = Vec::with_capacity(sets.len());

    for set in sets {
        let mut bindings = set.bindings.clone();
        bindings.sort_by_key(|b| b.binding);

        let mut plan = SetPlan {
            buffer_base: buffers,
            texture_base: textures,
            sampler_base: samplers,
            ..Default::default()
        };
        for binding in &bindings {
            let mut slot = BindingSlot {
                binding: binding.binding,
                ty: binding.ty,
                count: binding.count,
                stages: binding.stages,
                buffer_index: None,
                texture_index: None,
                sampler_index: None,
            };
            match binding.ty {
                DescriptorType::UniformBuffer | DescriptorType::StorageBuffer => {
                    slot.buffer_index = Some(buffers);
                    buffers += binding.count;
                }
                DescriptorType::SampledImage | DescriptorType::StorageImage => {
                    slot.texture_index = Some(textures);
                    textures += binding.count;
                }
                DescriptorType::Sampler => {
                    slot.sampler_index = Some(samplers);
                    samplers += binding.count;
                }
                DescriptorType::CombinedImageSampler => {
                    slot.texture_index = Some(textures);
                    slot.sampler_index = Some(samplers);
                    textures += binding.count;
                    samplers += binding.count;
                }
            }
            plan.bindings.push(slot);
        }
        plan.buffer_count = buffers - plan.buffer_base;
        plan.texture_count = textures - plan.texture_base;
        plan.sampler_count = samplers - plan.sampler_base;
        plans.push(plan);
    }

    if u64::from(buffers) > PUSH_CONSTANT_BUFFER_INDEX {
        return Err(GraphicsError::ResourceCreation(format!(
            "pipeline layout needs {} buffer arguments, Metal allows {}",
            buffers, PUSH_CONSTANT_BUFFER_INDEX
        ))
        .into());
    }
    if textures > MAX_TEXTURE_ARGUMENTS || samplers > MAX_SAMPLER_ARGUMENTS {
        return Err(GraphicsError::ResourceCreation(format!(
            "pipeline layout needs {} textures and {} samplers, Metal allows {} and {}",
            textures, samplers, MAX_TEXTURE_ARGUMENTS, MAX_SAMPLER_ARGUMENTS
        ))
        .into());
    }
    Ok(plans)
}

pub struct MetalPipelineLayout {
    pub(super) sets: Vec<SetPlan>,
    pub(super) push_constant_size: u32,
}

pub(super) fn create_pipeline_layout(desc: &PipelineLayoutDesc) -> Result<MetalPipelineLayout> {
    Ok(MetalPipelineLayout {
        sets: plan_sets(&desc.sets)?,
        push_constant_size: desc.push_constant_size(),
    })
}

/// 渲染管线及其固定功能状态
pub struct RenderState {
    pub(super) pipeline: RenderPipelineState,
    pub(super) depth_stencil: Option<DepthStencilState>,
    pub(super) cull: MTLCullMode,
    pub(super) winding: MTLWinding,
    pub(super) primitive: MTLPrimitiveType,
}

pub enum MetalPipeline {
    Render(RenderState),
    Compute {
        pipeline: ComputePipelineState,
        /// 每个线程组的线程数
        threads: MTLSize,
    },
}

fn function<'a>(shader: &'a MetalShader, stage: ShaderStage) -> Result<&'a FunctionRef> {
    shader
        .functions
        .iter()
        .find(|(s, _, _)| *s == stage)
        .map(|(_, _, f)| f.as_ref())
        .ok_or_else(|| GraphicsError::ShaderCompilation(format!("shader has no {:?} stage", stage)).into())
}

pub(super) fn create_graphics_pipeline(
    device: &Device,
    desc: &GraphicsPipelineDesc,
    shader: &MetalShader,
    shader_info: &CompiledShader,
) -> Result<MetalPipeline> {
    let descriptor = RenderPipelineDescriptor::new();
    descriptor.set_vertex_function(Some(function(shader, ShaderStage::Vertex)?));
    if let Ok(fragment) = function(shader, ShaderStage::Fragment) {
        descriptor.set_fragment_function(Some(fragment));
    }

    if !shader_info.reflection.vertex_inputs.is_empty() {
        let vertex = VertexDescriptor::new();
        for input in &shader_info.reflection.vertex_inputs {
            let attribute = vertex
                .attributes()
                .object_at(u64::from(input.location))
                .ok_or_else(|| GraphicsError::ResourceCreation(format!("vertex location {} out of range", input.location)))?;
            attribute.set_format(convert::vertex_format(input.format));
            attribute.set_offset(u64::from(input.offset));
            attribute.set_buffer_index(VERTEX_BUFFER_BASE + u64::from(input.binding));
        }
        for layout in &desc.vertex_buffers {
            let index = VERTEX_BUFFER_BASE + u64::from(layout.binding);
            if index >= MAX_BUFFER_ARGUMENTS {
                return Err(GraphicsError::ResourceCreation(format!(
                    "vertex buffer binding {} exceeds the Metal argument table",
                    layout.binding
                ))
                .into());
            }
            let buffer_layout = vertex
                .layouts()
                .object_at(index)
                .ok_or_else(|| GraphicsError::ResourceCreation(format!("vertex binding {} out of range", layout.binding)))?;
            buffer_layout.set_stride(u64::from(layout.stride));
            buffer_layout.set_step_rate(1);
            buffer_layout.set_step_function(if layout.per_instance {
                MTLVertexStepFunction::PerInstance
            } else {
                MTLVertexStepFunction::PerVertex
            });
        }
        descriptor.set_vertex_descriptor(Some(vertex));
    }

    for (i, format) in desc.color_formats.iter().enumerate() {
        let attachment = descriptor
            .color_attachments()
            .object_at(i as u64)
            .ok_or_else(|| GraphicsError::ResourceCreation(format!("color attachment {} out of range", i)))?;
        attachment.set_pixel_format(convert::pixel_format(*format));
        if desc.alpha_blend {
            attachment.set_blending_enabled(true);
            attachment.set_rgb_blend_operation(MTLBlendOperation::Add);
            attachment.set_alpha_blend_operation(MTLBlendOperation::Add);
            attachment.set_source_rgb_blend_factor(MTLBlendFactor::SourceAlpha);
            attachment.set_destination_rgb_blend_factor(MTLBlendFactor::OneMinusSourceAlpha);
            attachment.set_source_alpha_blend_factor(MTLBlendFactor::One);
            attachment.set_destination_alpha_blend_factor(MTLBlendFactor::OneMinusSourceAlpha);
        }
    }

    let depth_stencil = match desc.depth_format {
        Some(format) => {
            descriptor.set_depth_attachment_pixel_format(convert::pixel_format(format));
            if format.has_stencil() {
                descriptor.set_stencil_attachment_pixel_format(convert::pixel_format(format));
            }
            let state = DepthStencilDescriptor::new();
            state.set_depth_compare_function(desc.depth_compare.map_or(MTLCompareFunction::Always, convert::compare));
            state.set_depth_write_enabled(desc.depth_write);
            Some(device.new_depth_stencil_state(&state))
        }
        None => None,
    };

    let pipeline = device
        .new_render_pipeline_state(&descriptor)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("render pipeline creation failed: {}", e)))?;
    debug!(colors = desc.color_formats.len(), depth = desc.depth_format.is_some(), "Metal render pipeline created");

    Ok(MetalPipeline::Render(RenderState {
        pipeline,
        depth_stencil,
        cull: convert::cull_mode(desc.cull_mode),
        winding: convert::winding(desc.front_face),
        primitive: convert::primitive_type(desc.topology),
    }))
}

/// 反射缺失时每维按 1 处理
pub(super) fn threads_per_group(size: [u32; 3]) -> MTLSize {
    MTLSize::new(u64::from(size[0].max(1)), u64::from(size[1].max(1)), u64::from(size[2].max(1)))
}

pub(super) fn create_compute_pipeline(
    device: &Device,
    shader: &MetalShader,
    shader_info: &CompiledShader,
) -> Result<MetalPipeline> {
    let pipeline = device
        .new_compute_pipeline_state_with_function(function(shader, ShaderStage::Compute)?)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("compute pipeline creation failed: {}", e)))?;
    Ok(MetalPipeline::Compute {
        pipeline,
        threads: threads_per_group(shader_info.reflection.workgroup_size),
    })
}

/// 描述符集的当前内容
///
/// 绑定在编码时整体快照进命令列表，之后的更新不影响已关闭的列表。
pub struct MetalDescriptorSet {
    pub(super) plan: SetPlan,
    pub(super) buffers: Mutex<Vec<Option<(Buffer, u64)>>>,
    pub(super) textures: Mutex<Vec<Option<Texture>>>,
    pub(super) samplers: Mutex<Vec<Option<SamplerState>>>,
}

/// 绑定到参数表的一项
#[derive(Clone)]
pub(super) enum Argument {
    Buffer { index: u64, buffer: Buffer, offset: u64 },
    Texture { index: u64, texture: Texture },
    Sampler { index: u64, sampler: SamplerState },
}

#[derive(Clone)]
pub(super) struct BoundArgument {
    pub stages: ShaderStages,
    pub argument: Argument,
}

impl MetalDescriptorSet {
    pub(super) fn new(plan: SetPlan) -> Self {
        Self {
            buffers: Mutex::new(vec![None; plan.buffer_count as usize]),
            textures: Mutex::new(vec![None; plan.texture_count as usize]),
            samplers: Mutex::new(vec![None; plan.sampler_count as usize]),
            plan,
        }
    }

    /// 当前写入的全部绑定
    pub(super) fn snapshot(&self) -> Vec<BoundArgument> {
        let mut arguments = Vec::new();
        for slot in &self.plan.bindings {
            for element in 0..slot.count {
                if let Some(index) = slot.buffer_index {
                    let local = (index - self.plan.buffer_base + element) as usize;
                    if let Some(Some((buffer, offset))) = lock(&self.buffers).get(local) {
                        arguments.push(BoundArgument {
                            stages: slot.stages,
                            argument: Argument::Buffer {
                                index: u64::from(index + element),
                                buffer: buffer.clone(),
                                offset: *offset,
                            },
                        });
                    }
                }
                if let Some(index) = slot.texture_index {
                    let local = (index - self.plan.texture_base + element) as usize;
                    if let Some(Some(texture)) = lock(&self.textures).get(local) {
                        arguments.push(BoundArgument {
                            stages: slot.stages,
                            argument: Argument::Texture { index: u64::from(index + element), texture: texture.clone() },
                        });
                    }
                }
                if let Some(index) = slot.sampler_index {
                    let local = (index - self.plan.sampler_base + element) as usize;
                    if let Some(Some(sampler)) = lock(&self.samplers).get(local) {
                        arguments.push(BoundArgument {
                            stages: slot.stages,
                            argument: Argument::Sampler { index: u64::from(index + element), sampler: sampler.clone() },
                        });
                    }
                }
            }
        }
        arguments
    }
}

pub(super) fn write_buffers(
    set: &MetalDescriptorSet,
    binding: &DescriptorBinding,
    first_element: u32,
    writes: &[BufferWrite<'_, MetalBackend>],
) {
    let Some(index) = set.plan.slot(binding.binding).and_then(|s| s.buffer_index) else {
        return;
    };
    let mut buffers = lock(&set.buffers);
    for (i, write) in writes.iter().enumerate() {
        let local = (index - set.plan.buffer_base + first_element) as usize + i;
        if let Some(entry) = buffers.get_mut(local) {
            *entry = Some((write.buffer.raw.clone(), write.offset));
        }
    }
}

pub(super) fn write_images(
    set: &MetalDescriptorSet,
    binding: &DescriptorBinding,
    first_element: u32,
    writes: &[ImageWrite<'_, MetalBackend>],
) {
    let Some(slot) = set.plan.slot(binding.binding).copied() else {
        return;
    };
    if let Some(index) = slot.texture_index {
        let mut textures = lock(&set.textures);
        for (i, write) in writes.iter().enumerate() {
            let local = (index - set.plan.texture_base + first_element) as usize + i;
            if let (Some(entry), Some(texture)) = (textures.get_mut(local), write.texture) {
                *entry = Some(texture.raw.clone());
            }
        }
    }
    if let Some(index) = slot.sampler_index {
        let mut samplers = lock(&set.samplers);
        for (i, write) in writes.iter().enumerate() {
            let local = (index - set.plan.sampler_base + first_element) as usize + i;
            if let (Some(entry), Some(sampler)) = (samplers.get_mut(local), write.sampler) {
                *entry = Some(sampler.raw.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(binding: u32, ty: DescriptorType, count: u32) -> DescriptorBinding {
        DescriptorBinding { binding, ty, count, stages: ShaderStages::ALL_GRAPHICS }
    }

    #[test]
    fn test_slots_are_numbered_across_sets() {
        let sets = vec![
            DescriptorSetLayoutDesc {
                bindings: vec![
                    binding(1, DescriptorType::CombinedImageSampler, 2),
                    binding(0, DescriptorType::UniformBuffer, 1),
                ],
            },
            DescriptorSetLayoutDesc {
                bindings: vec![binding(0, DescriptorType::StorageBuffer, 3), binding(1, DescriptorType::Sampler, 1)],
            },
        ];
        let plans = plan_sets(&sets).unwrap();

        assert_eq!(plans[0].slot(0).unwrap().buffer_index, Some(0));
        assert_eq!(plans[0].slot(1).unwrap().texture_index, Some(0));
        assert_eq!(plans[0].slot(1).unwrap().sampler_index, Some(0));
        assert_eq!(plans[1].buffer_base, 1);
        assert_eq!(plans[1].slot(0).unwrap().buffer_index, Some(1));
        assert_eq!(plans[1].slot(1).unwrap().sampler_index, Some(2));
        assert_eq!(plans[1].texture_count, 0);
    }

    #[test]
    fn test_buffer_table_overflow_is_rejected() {
        let sets = vec![DescriptorSetLayoutDesc { bindings: vec![binding(0, DescriptorType::UniformBuffer, 16)] }];
        assert!(plan_sets(&sets).is_err());
    }

    #[test]
    fn test_missing_workgroup_size_defaults_to_one() {
        let size = threads_per_group([0, 0, 0]);
        assert_eq!((size.width, size.height, size.depth), (1, 1, 1));
        let size = threads_per_group([64, 1, 1]);
        assert_eq!(size.width, 64);
    }
}

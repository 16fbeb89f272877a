//! 着色器模块、管线、管线布局与描述符集

use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::Cursor;
use tracing::debug;

use super::{
    convert, vk_error, VulkanBackend, VulkanDescriptorSet, VulkanPipeline, VulkanPipelineLayout, VulkanShader,
};
use crate::backend::{BufferWrite, ImageWrite};
use crate::core::error::{GraphicsError, Result};
use crate::resource::{DescriptorBinding, DescriptorSetLayoutDesc, DescriptorType, PipelineLayoutDesc};
use crate::shader::{CompiledShader, GraphicsPipelineDesc, ShaderStage};

pub(super) fn create_shader(backend: &VulkanBackend, shader: &CompiledShader) -> Result<VulkanShader> {
    let device = backend.device();
    let mut modules = Vec::with_capacity(shader.stages.len());

    let result = shader.stages.iter().try_for_each(|binary| -> Result<()> {
        let words = ash::util::read_spv(&mut Cursor::new(&binary.code))
            .map_err(|e| GraphicsError::ShaderCompilation(format!("{:?} stage is not valid SPIR-V: {}", binary.stage, e)))?;
        let entry = CString::new(binary.entry_point.as_str())
            .map_err(|e| GraphicsError::ShaderCompilation(format!("invalid entry point: {}", e)))?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module =
            unsafe { device.create_shader_module(&info, None) }.map_err(vk_error("vkCreateShaderModule"))?;
        modules.push((binary.stage, module, entry));
        Ok(())
    });

    if let Err(e) = result {
        for (_, module, _) in modules {
            unsafe { device.destroy_shader_module(module, None) };
        }
        return Err(e);
    }
    Ok(VulkanShader { modules })
}

fn stage_info(shader: &VulkanShader, stage: ShaderStage) -> Option<vk::PipelineShaderStageCreateInfo> {
    shader.modules.iter().find(|(s, _, _)| *s == stage).map(|(s, module, entry)| {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(convert::shader_stage(*s))
            .module(*module)
            .name(entry)
            .build()
    })
}

fn missing_stage(stage: ShaderStage) -> GraphicsError {
    GraphicsError::ShaderCompilation(format!("shader has no {:?} stage", stage))
}

fn set_layout_bindings(desc: &DescriptorSetLayoutDesc) -> Vec<vk::DescriptorSetLayoutBinding> {
    desc.bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding.binding)
                .descriptor_type(convert::descriptor_type(binding.ty))
                .descriptor_count(binding.count)
                .stage_flags(convert::shader_stages(binding.stages))
                .build()
        })
        .collect()
}

pub(super) fn create_pipeline_layout(backend: &VulkanBackend, desc: &PipelineLayoutDesc) -> Result<VulkanPipelineLayout> {
    let device = backend.device();
    let mut set_layouts = Vec::with_capacity(desc.sets.len());

    let destroy_sets = |set_layouts: Vec<vk::DescriptorSetLayout>| {
        for layout in set_layouts {
            unsafe { device.destroy_descriptor_set_layout(layout, None) };
        }
    };

    for set in &desc.sets {
        let bindings = set_layout_bindings(set);
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        match unsafe { device.create_descriptor_set_layout(&info, None) } {
            Ok(layout) => set_layouts.push(layout),
            Err(e) => {
                destroy_sets(set_layouts);
                return Err(vk_error("vkCreateDescriptorSetLayout")(e));
            }
        }
    }

    let push_constants: Vec<vk::PushConstantRange> = desc
        .push_constants
        .iter()
        .map(|range| vk::PushConstantRange {
            stage_flags: convert::shader_stages(range.stages),
            offset: range.offset,
            size: range.size,
        })
        .collect();

    let info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constants);
    match unsafe { device.create_pipeline_layout(&info, None) } {
        Ok(raw) => Ok(VulkanPipelineLayout { raw, set_layouts }),
        Err(e) => {
            destroy_sets(set_layouts);
            Err(vk_error("vkCreatePipelineLayout")(e))
        }
    }
}

pub(super) fn create_graphics_pipeline(
    backend: &VulkanBackend,
    desc: &GraphicsPipelineDesc,
    shader: &VulkanShader,
    shader_info: &CompiledShader,
    layout: &VulkanPipelineLayout,
) -> Result<VulkanPipeline> {
    let mut stages = vec![stage_info(shader, ShaderStage::Vertex).ok_or_else(|| missing_stage(ShaderStage::Vertex))?];
    stages.extend(stage_info(shader, ShaderStage::Fragment));

    let vertex_bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_buffers
        .iter()
        .map(|layout| vk::VertexInputBindingDescription {
            binding: layout.binding,
            stride: layout.stride,
            input_rate: if layout.per_instance { vk::VertexInputRate::INSTANCE } else { vk::VertexInputRate::VERTEX },
        })
        .collect();
    let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = shader_info
        .reflection
        .vertex_inputs
        .iter()
        .map(|input| vk::VertexInputAttributeDescription {
            location: input.location,
            binding: input.binding,
            format: convert::format(input.format),
            offset: input.offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::builder().topology(convert::topology(desc.topology));
    let viewport = vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(convert::cull_mode(desc.cull_mode))
        .front_face(convert::front_face(desc.front_face))
        .line_width(1.0);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_test = desc.depth_format.is_some() && desc.depth_compare.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_test)
        .depth_write_enable(depth_test && desc.depth_write)
        .depth_compare_op(desc.depth_compare.map(convert::compare_op).unwrap_or(vk::CompareOp::ALWAYS));

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(desc.alpha_blend)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build()
        })
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc.color_formats.iter().map(|f| convert::format(*f)).collect();
    let depth_format = desc.depth_format.map(convert::format).unwrap_or(vk::Format::UNDEFINED);
    let stencil_format = desc
        .depth_format
        .filter(|f| f.has_stencil())
        .map(convert::format)
        .unwrap_or(vk::Format::UNDEFINED);
    let mut rendering = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout.raw)
        .push_next(&mut rendering)
        .build();

    let mut pipelines = unsafe {
        backend
            .device()
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
    }
    .map_err(|(_, e)| vk_error("vkCreateGraphicsPipelines")(e))?;

    let raw = pipelines
        .pop()
        .ok_or_else(|| GraphicsError::ResourceCreation("no graphics pipeline created".into()))?;
    debug!(stages = stages.len(), colors = color_formats.len(), "Graphics pipeline created");
    Ok(VulkanPipeline { raw, bind_point: vk::PipelineBindPoint::GRAPHICS })
}

pub(super) fn create_compute_pipeline(
    backend: &VulkanBackend,
    shader: &VulkanShader,
    layout: &VulkanPipelineLayout,
) -> Result<VulkanPipeline> {
    let stage = stage_info(shader, ShaderStage::Compute).ok_or_else(|| missing_stage(ShaderStage::Compute))?;
    let info = vk::ComputePipelineCreateInfo::builder().stage(stage).layout(layout.raw).build();

    let mut pipelines = unsafe {
        backend
            .device()
            .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
    }
    .map_err(|(_, e)| vk_error("vkCreateComputePipelines")(e))?;

    let raw = pipelines
        .pop()
        .ok_or_else(|| GraphicsError::ResourceCreation("no compute pipeline created".into()))?;
    Ok(VulkanPipeline { raw, bind_point: vk::PipelineBindPoint::COMPUTE })
}

/// 按布局精确计算池容量
fn pool_sizes(desc: &DescriptorSetLayoutDesc) -> Vec<vk::DescriptorPoolSize> {
    let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in &desc.bindings {
        *counts.entry(convert::descriptor_type(binding.ty).as_raw()).or_default() += binding.count;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, count)| vk::DescriptorPoolSize { ty: vk::DescriptorType::from_raw(ty), descriptor_count: count })
        .collect()
}

pub(super) fn create_descriptor_set(
    backend: &VulkanBackend,
    layout: &VulkanPipelineLayout,
    set_index: u32,
    desc: &DescriptorSetLayoutDesc,
) -> Result<VulkanDescriptorSet> {
    let set_layout = *layout
        .set_layouts
        .get(set_index as usize)
        .ok_or_else(|| GraphicsError::ResourceCreation(format!("pipeline layout has no set {}", set_index)))?;

    let device = backend.device();
    let sizes = pool_sizes(desc);
    let pool_info = vk::DescriptorPoolCreateInfo::builder().max_sets(1).pool_sizes(&sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(vk_error("vkCreateDescriptorPool"))?;

    let layouts = [set_layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let raw = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(mut sets) => sets.pop(),
        Err(e) => {
            unsafe { device.destroy_descriptor_pool(pool, None) };
            return Err(vk_error("vkAllocateDescriptorSets")(e));
        }
    };
    match raw {
        Some(raw) => Ok(VulkanDescriptorSet { pool, raw }),
        None => {
            unsafe { device.destroy_descriptor_pool(pool, None) };
            Err(GraphicsError::ResourceCreation("no descriptor set allocated".into()).into())
        }
    }
}

pub(super) fn write_buffers(
    backend: &VulkanBackend,
    set: &VulkanDescriptorSet,
    binding: &DescriptorBinding,
    first_element: u32,
    writes: &[BufferWrite<'_, VulkanBackend>],
) {
    let infos: Vec<vk::DescriptorBufferInfo> = writes
        .iter()
        .map(|w| vk::DescriptorBufferInfo { buffer: w.buffer.raw, offset: w.offset, range: w.range })
        .collect();
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set.raw)
        .dst_binding(binding.binding)
        .dst_array_element(first_element)
        .descriptor_type(convert::descriptor_type(binding.ty))
        .buffer_info(&infos)
        .build();
    unsafe { backend.device().update_descriptor_sets(&[write], &[]) };
}

fn image_layout(ty: DescriptorType) -> vk::ImageLayout {
    match ty {
        DescriptorType::StorageImage => vk::ImageLayout::GENERAL,
        DescriptorType::Sampler => vk::ImageLayout::UNDEFINED,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

pub(super) fn write_images(
    backend: &VulkanBackend,
    set: &VulkanDescriptorSet,
    binding: &DescriptorBinding,
    first_element: u32,
    writes: &[ImageWrite<'_, VulkanBackend>],
) {
    let layout = image_layout(binding.ty);
    let infos: Vec<vk::DescriptorImageInfo> = writes
        .iter()
        .map(|w| vk::DescriptorImageInfo {
            sampler: w.sampler.map(|s| s.raw).unwrap_or_default(),
            image_view: w.texture.map(|t| t.view).unwrap_or_default(),
            image_layout: layout,
        })
        .collect();
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set.raw)
        .dst_binding(binding.binding)
        .dst_array_element(first_element)
        .descriptor_type(convert::descriptor_type(binding.ty))
        .image_info(&infos)
        .build();
    unsafe { backend.device().update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderStages;

    #[test]
    fn test_pool_sizes_merge_same_type() {
        let desc = DescriptorSetLayoutDesc {
            bindings: vec![
                DescriptorBinding { binding: 0, ty: DescriptorType::UniformBuffer, count: 1, stages: ShaderStages::VERTEX },
                DescriptorBinding { binding: 1, ty: DescriptorType::SampledImage, count: 4, stages: ShaderStages::FRAGMENT },
                DescriptorBinding { binding: 2, ty: DescriptorType::UniformBuffer, count: 2, stages: ShaderStages::FRAGMENT },
            ],
        };
        let sizes = pool_sizes(&desc);
        assert_eq!(sizes.len(), 2);
        let uniform = sizes.iter().find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER).map(|s| s.descriptor_count);
        let sampled = sizes.iter().find(|s| s.ty == vk::DescriptorType::SAMPLED_IMAGE).map(|s| s.descriptor_count);
        assert_eq!(uniform, Some(3));
        assert_eq!(sampled, Some(4));
    }

    #[test]
    fn test_storage_images_use_general_layout() {
        assert_eq!(image_layout(DescriptorType::StorageImage), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(DescriptorType::CombinedImageSampler), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}

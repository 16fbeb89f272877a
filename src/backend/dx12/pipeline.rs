//! 根签名、管线状态对象与描述符写入
//!
//! 每个描述符集最多占两个根参数：一个 CBV/SRV/UAV 表、一个采样器表。
//! 组合图像采样器同时占用 `t` 与 `s` 寄存器，编号相同。

use std::ffi::c_void;
use windows::core::s;
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::{
    align_up, convert, dx_error, Dx12Backend, Dx12DescriptorSet, Dx12Pipeline, Dx12PipelineLayout, Dx12Shader,
    CONSTANT_BUFFER_ALIGNMENT,
};
use crate::backend::{BufferWrite, ImageWrite};
use crate::command::PipelineBindPoint;
use crate::core::error::{GraphicsError, Result};
use crate::resource::{DescriptorBinding, DescriptorSetLayoutDesc, DescriptorType, PipelineLayoutDesc, TextureDesc, TextureDimension};
use crate::shader::{CompiledShader, FrontFace, GraphicsPipelineDesc, ShaderStage, ShaderStages};

/// 推送常量所在的寄存器空间（`register(b0, space1000)`）
pub const PUSH_CONSTANT_SPACE: u32 = 1000;

/// 绑定点在描述符表中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BindingSlot {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub resource_offset: Option<u32>,
    pub sampler_offset: Option<u32>,
}

/// 一个描述符集在根签名中的布局
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct SetPlan {
    pub bindings: Vec<BindingSlot>,
    pub resource_count: u32,
    pub sampler_count: u32,
    pub resource_param: Option<u32>,
    pub sampler_param: Option<u32>,
}

impl SetPlan {
    pub fn slot(&self, binding: u32) -> Option<&BindingSlot> {
        self.bindings.iter().find(|s| s.binding == binding)
    }
}

fn resource_range_type(ty: DescriptorType) -> Option<D3D12_DESCRIPTOR_RANGE_TYPE> {
    match ty {
        DescriptorType::UniformBuffer => Some(D3D12_DESCRIPTOR_RANGE_TYPE_CBV),
        DescriptorType::StorageBuffer | DescriptorType::StorageImage => Some(D3D12_DESCRIPTOR_RANGE_TYPE_UAV),
        DescriptorType::SampledImage | DescriptorType::CombinedImageSampler => Some(D3D12_DESCRIPTOR_RANGE_TYPE_SRV),
        DescriptorType::Sampler => None,
    }
}

fn uses_sampler(ty: DescriptorType) -> bool {
    matches!(ty, DescriptorType::Sampler | DescriptorType::CombinedImageSampler)
}

/// 按绑定号排列，计算每个绑定在两张表中的偏移
pub(super) fn plan_set(desc: &DescriptorSetLayoutDesc) -> SetPlan {
    let mut bindings = desc.bindings.clone();
    bindings.sort_by_key(|b| b.binding);

    let mut plan = SetPlan::default();
    for binding in bindings {
        let count = binding.count.max(1);
        let resource_offset = resource_range_type(binding.ty).map(|_| {
            plan.resource_count += count;
            plan.resource_count - count
        });
        let sampler_offset = uses_sampler(binding.ty).then(|| {
            plan.sampler_count += count;
            plan.sampler_count - count
        });
        plan.bindings.push(BindingSlot {
            binding: binding.binding,
            ty: binding.ty,
            count,
            resource_offset,
            sampler_offset,
        });
    }
    plan
}

fn set_ranges(plan: &SetPlan, space: u32) -> (Vec<D3D12_DESCRIPTOR_RANGE>, Vec<D3D12_DESCRIPTOR_RANGE>) {
    let mut resources = Vec::new();
    let mut samplers = Vec::new();
    for slot in &plan.bindings {
        if let (Some(offset), Some(ty)) = (slot.resource_offset, resource_range_type(slot.ty)) {
            resources.push(D3D12_DESCRIPTOR_RANGE {
                RangeType: ty,
                NumDescriptors: slot.count,
                BaseShaderRegister: slot.binding,
                RegisterSpace: space,
                OffsetInDescriptorsFromTableStart: offset,
            });
        }
        if let Some(offset) = slot.sampler_offset {
            samplers.push(D3D12_DESCRIPTOR_RANGE {
                RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
                NumDescriptors: slot.count,
                BaseShaderRegister: slot.binding,
                RegisterSpace: space,
                OffsetInDescriptorsFromTableStart: offset,
            });
        }
    }
    (resources, samplers)
}

fn table_parameter(ranges: &[D3D12_DESCRIPTOR_RANGE]) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: ranges.len() as u32,
                pDescriptorRanges: ranges.as_ptr(),
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

pub(super) fn create_pipeline_layout(device: &ID3D12Device, desc: &PipelineLayoutDesc) -> Result<Dx12PipelineLayout> {
    let mut sets: Vec<SetPlan> = desc.sets.iter().map(plan_set).collect();
    let ranges: Vec<_> = sets
        .iter()
        .enumerate()
        .map(|(space, plan)| set_ranges(plan, space as u32))
        .collect();

    let mut parameters = Vec::new();
    for (plan, (resources, samplers)) in sets.iter_mut().zip(&ranges) {
        if !resources.is_empty() {
            plan.resource_param = Some(parameters.len() as u32);
            parameters.push(table_parameter(resources));
        }
        if !samplers.is_empty() {
            plan.sampler_param = Some(parameters.len() as u32);
            parameters.push(table_parameter(samplers));
        }
    }

    let push_constant_size = desc.push_constant_size();
    let push_constants = (push_constant_size > 0).then(|| {
        let stages = desc
            .push_constants
            .iter()
            .fold(ShaderStages::empty(), |acc, range| acc | range.stages);
        parameters.push(D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                Constants: D3D12_ROOT_CONSTANTS {
                    ShaderRegister: 0,
                    RegisterSpace: PUSH_CONSTANT_SPACE,
                    Num32BitValues: push_constant_size.div_ceil(4),
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        });
        (parameters.len() as u32 - 1, stages)
    });

    let root_desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 0,
        pStaticSamplers: std::ptr::null(),
        Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
    };

    unsafe {
        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        if let Err(e) = D3D12SerializeRootSignature(&root_desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut blob, Some(&mut error)) {
            let detail = error
                .map(|error| {
                    let bytes = std::slice::from_raw_parts(error.GetBufferPointer() as *const u8, error.GetBufferSize());
                    String::from_utf8_lossy(bytes).into_owned()
                })
                .unwrap_or_else(|| e.to_string());
            return Err(GraphicsError::ResourceCreation(format!("Failed to serialize root signature: {}", detail)).into());
        }
        let blob = blob.ok_or_else(|| GraphicsError::ResourceCreation("root signature blob is empty".into()))?;
        let root_signature: ID3D12RootSignature = device
            .CreateRootSignature(
                0,
                std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()),
            )
            .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create root signature: {}", e)))?;

        Ok(Dx12PipelineLayout { root_signature, sets, push_constants })
    }
}

fn bytecode(shader: &Dx12Shader, stage: ShaderStage) -> Option<D3D12_SHADER_BYTECODE> {
    shader.stages.iter().find(|(s, _)| *s == stage).map(|(_, code)| D3D12_SHADER_BYTECODE {
        pShaderBytecode: code.as_ptr() as *const c_void,
        BytecodeLength: code.len(),
    })
}

fn missing_stage(stage: ShaderStage) -> GraphicsError {
    GraphicsError::ShaderCompilation(format!("shader has no {:?} stage", stage))
}

/// 顶点属性统一使用 `TEXCOORD{location}` 语义
pub(super) fn create_graphics_pipeline(
    device: &ID3D12Device,
    desc: &GraphicsPipelineDesc,
    shader: &Dx12Shader,
    shader_info: &CompiledShader,
    layout: &Dx12PipelineLayout,
) -> Result<Dx12Pipeline> {
    let vs = bytecode(shader, ShaderStage::Vertex).ok_or_else(|| missing_stage(ShaderStage::Vertex))?;

    let elements: Vec<D3D12_INPUT_ELEMENT_DESC> = shader_info
        .reflection
        .vertex_inputs
        .iter()
        .map(|input| {
            let per_instance = desc
                .vertex_buffers
                .iter()
                .any(|b| b.binding == input.binding && b.per_instance);
            D3D12_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: input.location,
                Format: convert::format(input.format),
                InputSlot: input.binding,
                AlignedByteOffset: input.offset,
                InputSlotClass: if per_instance {
                    D3D12_INPUT_CLASSIFICATION_PER_INSTANCE_DATA
                } else {
                    D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA
                },
                InstanceDataStepRate: u32::from(per_instance),
            }
        })
        .collect();

    let blend = D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: desc.alpha_blend.into(),
        LogicOpEnable: false.into(),
        SrcBlend: D3D12_BLEND_SRC_ALPHA,
        DestBlend: D3D12_BLEND_INV_SRC_ALPHA,
        BlendOp: D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: D3D12_BLEND_ONE,
        DestBlendAlpha: D3D12_BLEND_INV_SRC_ALPHA,
        BlendOpAlpha: D3D12_BLEND_OP_ADD,
        LogicOp: D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
    };

    let mut pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC::default();
    // 借用根签名，不增加引用计数
    pso_desc.pRootSignature = unsafe { std::mem::transmute_copy(&layout.root_signature) };
    pso_desc.VS = vs;
    pso_desc.PS = bytecode(shader, ShaderStage::Fragment).unwrap_or_default();
    pso_desc.BlendState = D3D12_BLEND_DESC {
        AlphaToCoverageEnable: false.into(),
        IndependentBlendEnable: false.into(),
        RenderTarget: [blend; 8],
    };
    pso_desc.SampleMask = u32::MAX;
    pso_desc.RasterizerState = D3D12_RASTERIZER_DESC {
        FillMode: D3D12_FILL_MODE_SOLID,
        CullMode: convert::cull_mode(desc.cull_mode),
        FrontCounterClockwise: (desc.front_face == FrontFace::CounterClockwise).into(),
        DepthClipEnable: true.into(),
        ..Default::default()
    };
    pso_desc.DepthStencilState = D3D12_DEPTH_STENCIL_DESC {
        DepthEnable: desc.depth_compare.is_some().into(),
        DepthWriteMask: if desc.depth_write { D3D12_DEPTH_WRITE_MASK_ALL } else { D3D12_DEPTH_WRITE_MASK_ZERO },
        DepthFunc: desc.depth_compare.map(convert::compare).unwrap_or(D3D12_COMPARISON_FUNC_ALWAYS),
        StencilEnable: false.into(),
        StencilReadMask: 0xFF,
        StencilWriteMask: 0xFF,
        FrontFace: D3D12_DEPTH_STENCILOP_DESC::default(),
        BackFace: D3D12_DEPTH_STENCILOP_DESC::default(),
    };
    pso_desc.InputLayout = D3D12_INPUT_LAYOUT_DESC {
        pInputElementDescs: elements.as_ptr(),
        NumElements: elements.len() as u32,
    };
    pso_desc.PrimitiveTopologyType = convert::topology_type(desc.topology);
    pso_desc.NumRenderTargets = desc.color_formats.len().min(8) as u32;
    for (slot, format) in pso_desc.RTVFormats.iter_mut().zip(&desc.color_formats) {
        *slot = convert::format(*format);
    }
    pso_desc.DSVFormat = desc.depth_format.map(convert::format).unwrap_or(DXGI_FORMAT_UNKNOWN);
    pso_desc.SampleDesc.Count = 1;

    let raw: ID3D12PipelineState = unsafe { device.CreateGraphicsPipelineState(&pso_desc) }
        .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create graphics PSO: {}", e)))?;

    Ok(Dx12Pipeline {
        raw,
        root_signature: layout.root_signature.clone(),
        bind_point: PipelineBindPoint::Graphics,
        topology: convert::topology(desc.topology),
        vertex_strides: desc.vertex_buffers.iter().map(|b| (b.binding, b.stride)).collect(),
    })
}

pub(super) fn create_compute_pipeline(
    device: &ID3D12Device,
    shader: &Dx12Shader,
    layout: &Dx12PipelineLayout,
) -> Result<Dx12Pipeline> {
    let cs = bytecode(shader, ShaderStage::Compute).ok_or_else(|| missing_stage(ShaderStage::Compute))?;
    let mut pso_desc = D3D12_COMPUTE_PIPELINE_STATE_DESC::default();
    pso_desc.pRootSignature = unsafe { std::mem::transmute_copy(&layout.root_signature) };
    pso_desc.CS = cs;

    let raw: ID3D12PipelineState = unsafe { device.CreateComputePipelineState(&pso_desc) }
        .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create compute PSO: {}", e)))?;

    Ok(Dx12Pipeline {
        raw,
        root_signature: layout.root_signature.clone(),
        bind_point: PipelineBindPoint::Compute,
        topology: convert::topology(crate::shader::PrimitiveTopology::TriangleList),
        vertex_strides: Vec::new(),
    })
}

/// 间接命令种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IndirectKind {
    Draw,
    DrawIndexed,
    Dispatch,
}

impl IndirectKind {
    /// 紧密排列时的参数大小
    pub fn natural_stride(self) -> u32 {
        match self {
            IndirectKind::Draw => 16,
            IndirectKind::DrawIndexed => 20,
            IndirectKind::Dispatch => 12,
        }
    }
}

pub(super) fn create_command_signature(
    device: &ID3D12Device,
    kind: IndirectKind,
    stride: u32,
) -> Result<ID3D12CommandSignature> {
    let argument = D3D12_INDIRECT_ARGUMENT_DESC {
        Type: match kind {
            IndirectKind::Draw => D3D12_INDIRECT_ARGUMENT_TYPE_DRAW,
            IndirectKind::DrawIndexed => D3D12_INDIRECT_ARGUMENT_TYPE_DRAW_INDEXED,
            IndirectKind::Dispatch => D3D12_INDIRECT_ARGUMENT_TYPE_DISPATCH,
        },
        ..Default::default()
    };
    let desc = D3D12_COMMAND_SIGNATURE_DESC {
        ByteStride: stride,
        NumArgumentDescs: 1,
        pArgumentDescs: &argument,
        NodeMask: 0,
    };
    let mut signature: Option<ID3D12CommandSignature> = None;
    unsafe { device.CreateCommandSignature(&desc, None::<&ID3D12RootSignature>, &mut signature) }
        .map_err(dx_error("CreateCommandSignature"))?;
    signature.ok_or_else(|| GraphicsError::ResourceCreation("command signature is null".into()).into())
}

/// 纹理的着色器资源视图描述
pub(super) fn srv_desc(desc: &TextureDesc) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
    let mip_levels = desc.mip_levels.max(1);
    let (dimension, anonymous) = match desc.dimension {
        TextureDimension::D3 => (
            D3D12_SRV_DIMENSION_TEXTURE3D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture3D: D3D12_TEX3D_SRV { MostDetailedMip: 0, MipLevels: mip_levels, ResourceMinLODClamp: 0.0 },
            },
        ),
        TextureDimension::Cube => (
            D3D12_SRV_DIMENSION_TEXTURECUBE,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                TextureCube: D3D12_TEXCUBE_SRV { MostDetailedMip: 0, MipLevels: mip_levels, ResourceMinLODClamp: 0.0 },
            },
        ),
        TextureDimension::D2 if desc.array_layers > 1 => (
            D3D12_SRV_DIMENSION_TEXTURE2DARRAY,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2DArray: D3D12_TEX2D_ARRAY_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mip_levels,
                    FirstArraySlice: 0,
                    ArraySize: desc.array_layers,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
        TextureDimension::D2 => (
            D3D12_SRV_DIMENSION_TEXTURE2D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mip_levels,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
    };

    D3D12_SHADER_RESOURCE_VIEW_DESC {
        Format: convert::srv_format(desc.format),
        ViewDimension: dimension,
        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
        Anonymous: anonymous,
    }
}

pub(super) fn write_buffers(
    backend: &Dx12Backend,
    set: &Dx12DescriptorSet,
    binding: &DescriptorBinding,
    first_element: u32,
    writes: &[BufferWrite<'_, Dx12Backend>],
) {
    let (Some(slot), Some(start)) = (set.plan.slot(binding.binding), set.resource_start) else {
        tracing::error!(binding = binding.binding, "Descriptor set has no table entry for binding");
        return;
    };
    let Some(offset) = slot.resource_offset else {
        return;
    };

    for (i, write) in writes.iter().enumerate() {
        let handle = backend
            .shader_view_heap
            .cpu_handle(start + offset + first_element + i as u32);
        unsafe {
            match binding.ty {
                DescriptorType::UniformBuffer => {
                    let view = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                        BufferLocation: write.buffer.gpu_address + write.offset,
                        SizeInBytes: align_up(write.range, CONSTANT_BUFFER_ALIGNMENT) as u32,
                    };
                    backend.device.CreateConstantBufferView(Some(&view), handle);
                }
                DescriptorType::StorageBuffer => {
                    let view = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: DXGI_FORMAT_R32_TYPELESS,
                        ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Buffer: D3D12_BUFFER_UAV {
                                FirstElement: write.offset / 4,
                                NumElements: (write.range / 4) as u32,
                                StructureByteStride: 0,
                                CounterOffsetInBytes: 0,
                                Flags: D3D12_BUFFER_UAV_FLAG_RAW,
                            },
                        },
                    };
                    backend
                        .device
                        .CreateUnorderedAccessView(&write.buffer.raw, None::<&ID3D12Resource>, Some(&view), handle);
                }
                _ => {}
            }
        }
    }
}

pub(super) fn write_images(
    backend: &Dx12Backend,
    set: &Dx12DescriptorSet,
    binding: &DescriptorBinding,
    first_element: u32,
    writes: &[ImageWrite<'_, Dx12Backend>],
) {
    let Some(slot) = set.plan.slot(binding.binding) else {
        tracing::error!(binding = binding.binding, "Descriptor set has no table entry for binding");
        return;
    };

    for (i, write) in writes.iter().enumerate() {
        let element = first_element + i as u32;

        if let (Some(texture), Some(offset), Some(start)) = (write.texture, slot.resource_offset, set.resource_start) {
            let source = match binding.ty {
                DescriptorType::StorageImage => texture.uav,
                _ => texture.srv,
            };
            match source {
                Some(index) => unsafe {
                    backend.device.CopyDescriptorsSimple(
                        1,
                        backend.shader_view_heap.cpu_handle(start + offset + element),
                        backend.view_heap.cpu_handle(index),
                        D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    );
                },
                None => tracing::error!(
                    binding = binding.binding,
                    element,
                    "Texture was not created with the usage this descriptor needs"
                ),
            }
        }

        if let (Some(sampler), Some(offset), Some(start)) = (write.sampler, slot.sampler_offset, set.sampler_start) {
            unsafe {
                backend.device.CopyDescriptorsSimple(
                    1,
                    backend.shader_sampler_heap.cpu_handle(start + offset + element),
                    backend.sampler_heap.cpu_handle(sampler.index),
                    D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
                );
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
    fn test_plan_assigns_table_offsets_in_binding_order() {
        let plan = plan_set(&DescriptorSetLayoutDesc {
            bindings: vec![
                binding(3, DescriptorType::Sampler, 2),
                binding(0, DescriptorType::UniformBuffer, 1),
                binding(1, DescriptorType::CombinedImageSampler, 4),
            ],
        });

        assert_eq!(plan.resource_count, 5);
        assert_eq!(plan.sampler_count, 6);
        let combined = plan.slot(1).unwrap();
        assert_eq!(combined.resource_offset, Some(1));
        assert_eq!(combined.sampler_offset, Some(0));
        assert_eq!(plan.slot(3).unwrap().sampler_offset, Some(4));
        assert_eq!(plan.slot(3).unwrap().resource_offset, None);
    }

    #[test]
    fn test_ranges_use_set_index_as_register_space() {
        let plan = plan_set(&DescriptorSetLayoutDesc {
            bindings: vec![binding(2, DescriptorType::StorageImage, 1)],
        });
        let (resources, samplers) = set_ranges(&plan, 3);
        assert!(samplers.is_empty());
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].RangeType, D3D12_DESCRIPTOR_RANGE_TYPE_UAV);
        assert_eq!(resources[0].BaseShaderRegister, 2);
        assert_eq!(resources[0].RegisterSpace, 3);
    }

    #[test]
    fn test_natural_indirect_strides() {
        assert_eq!(IndirectKind::DrawIndexed.natural_stride(), 20);
        assert_eq!(IndirectKind::Dispatch.natural_stride(), 12);
    }
}

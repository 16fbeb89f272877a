//! 着色器与管线描述
//!
//! 着色器交叉编译是外部服务：调用方实现 `ShaderCompiler`，输入各阶段源码与
//! include 搜索路径，返回目标后端的二进制以及反射布局。后端直接按反射布局
//! 构建原生管线布局 / 描述符布局，不解析着色器源码。

use std::path::PathBuf;

use crate::core::error::Result;
use crate::handle::{PipelineLayoutHandle, ShaderHandle};
use crate::resource::{flag_set, CompareOp, DescriptorSetLayoutDesc, Format, PipelineLayoutDesc, PushConstantRange};

flag_set!(
    /// 着色器阶段集合
    ShaderStages {
        VERTEX = 1 << 0,
        FRAGMENT = 1 << 1,
        COMPUTE = 1 << 2,
    }
);

impl ShaderStages {
    pub const ALL_GRAPHICS: Self = Self(Self::VERTEX.bits() | Self::FRAGMENT.bits());
}

/// 单个着色器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn flag(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
        }
    }
}

/// 编译目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderTarget {
    /// SPIR-V（Vulkan）
    Spirv,
    /// DXIL / DXBC（DirectX 12）
    Dxil,
    /// Metal Shading Language 源码
    Msl,
    /// 不需要真实二进制（null 后端）
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    pub source: String,
    pub entry_point: String,
}

/// 着色器编译请求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderDesc {
    pub name: String,
    pub stages: Vec<ShaderSource>,
    pub include_dirs: Vec<PathBuf>,
}

/// 顶点输入属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

/// 着色器反射布局
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflectionLayout {
    /// 按 set 下标排列的描述符集布局
    pub sets: Vec<DescriptorSetLayoutDesc>,
    pub push_constants: Vec<PushConstantRange>,
    pub vertex_inputs: Vec<VertexInput>,
    /// 计算着色器的线程组大小；Metal 分发时需要显式给出，全 0 表示未知
    pub workgroup_size: [u32; 3],
}

impl ReflectionLayout {
    /// 原样转换为管线布局描述
    pub fn pipeline_layout(&self) -> PipelineLayoutDesc {
        PipelineLayoutDesc {
            sets: self.sets.clone(),
            push_constants: self.push_constants.clone(),
        }
    }
}

/// 单个阶段的编译产物
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBinary {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub code: Vec<u8>,
}

/// 编译结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledShader {
    pub stages: Vec<StageBinary>,
    pub reflection: ReflectionLayout,
}

impl CompiledShader {
    pub fn stage(&self, stage: ShaderStage) -> Option<&StageBinary> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// 外部着色器编译服务
pub trait ShaderCompiler {
    fn compile(&self, desc: &ShaderDesc, target: ShaderTarget) -> Result<CompiledShader>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

/// 顶点缓冲布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferLayout {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub shader: ShaderHandle,
    pub layout: PipelineLayoutHandle,
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub depth_compare: Option<CompareOp>,
    pub depth_write: bool,
    pub alpha_blend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputePipelineDesc {
    pub shader: ShaderHandle,
    pub layout: PipelineLayoutHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DescriptorBinding, DescriptorType};

    #[test]
    fn test_reflection_to_pipeline_layout_is_verbatim() {
        let reflection = ReflectionLayout {
            sets: vec![DescriptorSetLayoutDesc {
                bindings: vec![DescriptorBinding {
                    binding: 0,
                    ty: DescriptorType::UniformBuffer,
                    count: 1,
                    stages: ShaderStages::ALL_GRAPHICS,
                }],
            }],
            push_constants: vec![PushConstantRange { stages: ShaderStages::VERTEX, offset: 0, size: 64 }],
            vertex_inputs: vec![],
            workgroup_size: [0; 3],
        };

        let layout = reflection.pipeline_layout();
        assert_eq!(layout.sets, reflection.sets);
        assert_eq!(layout.push_constant_size(), 64);
    }

    #[test]
    fn test_stage_lookup() {
        let shader = CompiledShader {
            stages: vec![StageBinary {
                stage: ShaderStage::Compute,
                entry_point: "main".into(),
                code: vec![],
            }],
            reflection: ReflectionLayout::default(),
        };
        assert!(shader.stage(ShaderStage::Compute).is_some());
        assert!(shader.stage(ShaderStage::Vertex).is_none());
        assert!(ShaderStages::ALL_GRAPHICS.contains(ShaderStage::Fragment.flag()));
    }
}

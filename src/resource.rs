//! 资源与描述符的后端无关描述
//!
//! 这里只包含纯数据：创建描述（缓冲区、纹理、采样器、描述符布局）以及
//! 描述符集更新时需要的校验信息。原生对象由各后端持有。

use crate::core::error::DescriptorUpdateError;
use crate::handle::{BufferHandle, SamplerHandle, TextureHandle};
use crate::shader::ShaderStages;

/// 像素 / 顶点属性格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Undefined,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    R32Uint,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    /// 每个像素（或顶点属性）的字节数
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::Rg16Float
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgb32Float => 12,
            Format::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $(pub const $flag: Self = Self($bit);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let names: Vec<&str> = [$((stringify!($flag), Self::$flag)),*]
                    .iter()
                    .filter(|(_, flag)| self.contains(*flag))
                    .map(|(name, _)| *name)
                    .collect();
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

pub(crate) use flag_set;

flag_set!(
    /// 缓冲区用途
    BufferUsage {
        VERTEX = 1 << 0,
        INDEX = 1 << 1,
        UNIFORM = 1 << 2,
        STORAGE = 1 << 3,
        INDIRECT = 1 << 4,
        TRANSFER_SRC = 1 << 5,
        TRANSFER_DST = 1 << 6,
    }
);

flag_set!(
    /// 纹理用途
    TextureUsage {
        SAMPLED = 1 << 0,
        STORAGE = 1 << 1,
        COLOR_ATTACHMENT = 1 << 2,
        DEPTH_STENCIL = 1 << 3,
        TRANSFER_SRC = 1 << 4,
        TRANSFER_DST = 1 << 5,
    }
);

/// 内存位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// 仅 GPU 可见
    GpuOnly,
    /// CPU 写、GPU 读（上传）
    CpuToGpu,
    /// GPU 写、CPU 读（回读）
    GpuToCpu,
}

impl MemoryLocation {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryLocation,
    pub name: Option<String>,
}

impl BufferDesc {
    /// 内部暂存缓冲区（上传用）
    pub fn staging(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryLocation::CpuToGpu,
            name: Some("staging".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureDimension {
    D2,
    D3,
    Cube,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: TextureUsage,
    pub dimension: TextureDimension,
    pub name: Option<String>,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: Format, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
            dimension: TextureDimension::D2,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub max_anisotropy: Option<f32>,
    pub compare: Option<CompareOp>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            max_anisotropy: None,
            compare: None,
        }
    }
}

/// 描述符类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    CombinedImageSampler,
}

impl DescriptorType {
    /// 只能由缓冲区更新
    pub fn is_buffer(self) -> bool {
        matches!(self, DescriptorType::UniformBuffer | DescriptorType::StorageBuffer)
    }

    /// 只能由图像 / 采样器更新
    pub fn is_image(self) -> bool {
        !self.is_buffer()
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorType::UniformBuffer => "uniform buffer",
            DescriptorType::StorageBuffer => "storage buffer",
            DescriptorType::SampledImage => "sampled image",
            DescriptorType::StorageImage => "storage image",
            DescriptorType::Sampler => "sampler",
            DescriptorType::CombinedImageSampler => "combined image sampler",
        }
    }
}

/// 描述符集布局中的一个绑定点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutDesc {
    pub fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

/// 管线布局：按 set 下标排列的描述符集布局加推送常量区间
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineLayoutDesc {
    pub sets: Vec<DescriptorSetLayoutDesc>,
    pub push_constants: Vec<PushConstantRange>,
}

impl PipelineLayoutDesc {
    /// 推送常量覆盖的总字节数
    pub fn push_constant_size(&self) -> u32 {
        self.push_constants
            .iter()
            .map(|r| r.offset + r.size)
            .max()
            .unwrap_or(0)
    }
}

/// 更新调用的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorUpdateKind {
    Buffer,
    Image,
}

impl DescriptorUpdateKind {
    fn name(self) -> &'static str {
        match self {
            DescriptorUpdateKind::Buffer => "buffer",
            DescriptorUpdateKind::Image => "image",
        }
    }
}

/// 描述符集的校验状态
///
/// 保存创建时的布局声明，后续每次更新都对照它做范围和类型检查。
#[derive(Debug, Clone)]
pub struct DescriptorSetState {
    pub set_index: u32,
    pub layout: DescriptorSetLayoutDesc,
}

impl DescriptorSetState {
    pub fn new(set_index: u32, layout: DescriptorSetLayoutDesc) -> Self {
        Self { set_index, layout }
    }

    /// 校验一次更新
    ///
    /// # 参数
    ///
    /// * `binding` - 绑定点
    /// * `first_element` - 数组起始元素
    /// * `count` - 更新的描述符数量
    /// * `kind` - 调用的更新种类（缓冲区 / 图像）
    ///
    /// # 返回值
    ///
    /// 通过校验时返回该绑定点的声明
    pub fn validate_update(
        &self,
        binding: u32,
        first_element: u32,
        count: u32,
        kind: DescriptorUpdateKind,
    ) -> Result<&DescriptorBinding, DescriptorUpdateError> {
        let declared = self
            .layout
            .binding(binding)
            .ok_or(DescriptorUpdateError::BindingOutOfRange { binding })?;

        let requested = first_element.saturating_add(count);
        if requested > declared.count {
            return Err(DescriptorUpdateError::CountExceeded {
                binding,
                requested,
                declared: declared.count,
            });
        }

        let type_ok = match kind {
            DescriptorUpdateKind::Buffer => declared.ty.is_buffer(),
            DescriptorUpdateKind::Image => declared.ty.is_image(),
        };
        if !type_ok {
            return Err(DescriptorUpdateError::TypeMismatch {
                binding,
                declared: declared.ty.name(),
                update: kind.name(),
            });
        }

        Ok(declared)
    }
}

/// 缓冲区描述符更新的一个元素
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `None` 表示从 `offset` 到缓冲区末尾
    pub range: Option<u64>,
}

impl BufferBinding {
    pub fn whole(buffer: BufferHandle) -> Self {
        Self { buffer, offset: 0, range: None }
    }
}

/// 图像 / 采样器描述符更新的一个元素
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBinding {
    pub texture: Option<TextureHandle>,
    pub sampler: Option<SamplerHandle>,
}

impl ImageBinding {
    pub fn texture(texture: TextureHandle) -> Self {
        Self { texture: Some(texture), sampler: None }
    }

    pub fn sampler(sampler: SamplerHandle) -> Self {
        Self { texture: None, sampler: Some(sampler) }
    }

    pub fn combined(texture: TextureHandle, sampler: SamplerHandle) -> Self {
        Self { texture: Some(texture), sampler: Some(sampler) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DescriptorSetState {
        DescriptorSetState::new(
            0,
            DescriptorSetLayoutDesc {
                bindings: vec![
                    DescriptorBinding {
                        binding: 0,
                        ty: DescriptorType::UniformBuffer,
                        count: 1,
                        stages: ShaderStages::VERTEX,
                    },
                    DescriptorBinding {
                        binding: 2,
                        ty: DescriptorType::CombinedImageSampler,
                        count: 4,
                        stages: ShaderStages::FRAGMENT,
                    },
                ],
            },
        )
    }

    #[test]
    fn test_valid_updates() {
        let s = state();
        assert!(s.validate_update(0, 0, 1, DescriptorUpdateKind::Buffer).is_ok());
        assert!(s.validate_update(2, 1, 3, DescriptorUpdateKind::Image).is_ok());
    }

    #[test]
    fn test_binding_out_of_range() {
        assert_eq!(
            state().validate_update(1, 0, 1, DescriptorUpdateKind::Buffer),
            Err(DescriptorUpdateError::BindingOutOfRange { binding: 1 })
        );
    }

    #[test]
    fn test_count_exceeded() {
        assert_eq!(
            state().validate_update(2, 2, 3, DescriptorUpdateKind::Image),
            Err(DescriptorUpdateError::CountExceeded { binding: 2, requested: 5, declared: 4 })
        );
        assert!(state().validate_update(0, 0, 2, DescriptorUpdateKind::Buffer).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        assert!(matches!(
            state().validate_update(0, 0, 1, DescriptorUpdateKind::Image),
            Err(DescriptorUpdateError::TypeMismatch { binding: 0, .. })
        ));
        assert!(matches!(
            state().validate_update(2, 0, 1, DescriptorUpdateKind::Buffer),
            Err(DescriptorUpdateError::TypeMismatch { binding: 2, .. })
        ));
    }

    #[test]
    fn test_flag_set_ops() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::INDEX));
        assert!(usage.intersects(BufferUsage::TRANSFER_DST | BufferUsage::UNIFORM));
        assert_eq!(format!("{:?}", usage), "BufferUsage(VERTEX | TRANSFER_DST)");
    }

    #[test]
    fn test_format_sizes() {
        assert_eq!(Format::Rgba8Unorm.bytes_per_pixel(), 4);
        assert_eq!(Format::Rgb32Float.bytes_per_pixel(), 12);
        assert!(Format::D24UnormS8Uint.has_stencil());
    }
}

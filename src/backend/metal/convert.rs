//! 后端无关枚举到 Metal 枚举的映射

use ::metal::*;

use crate::command::{IndexType, LoadOp, StoreOp};
use crate::resource::{AddressMode, CompareOp, Filter, Format, TextureUsage};
use crate::shader::{CullMode, FrontFace, PrimitiveTopology};

pub(super) fn pixel_format(format: Format) -> MTLPixelFormat {
    match format {
        Format::Undefined | Format::Rgb32Float => MTLPixelFormat::Invalid,
        Format::R8Unorm => MTLPixelFormat::R8Unorm,
        Format::Rg8Unorm => MTLPixelFormat::RG8Unorm,
        Format::Rgba8Unorm => MTLPixelFormat::RGBA8Unorm,
        Format::Rgba8Srgb => MTLPixelFormat::RGBA8Unorm_sRGB,
        Format::Bgra8Unorm => MTLPixelFormat::BGRA8Unorm,
        Format::Bgra8Srgb => MTLPixelFormat::BGRA8Unorm_sRGB,
        Format::R16Float => MTLPixelFormat::R16Float,
        Format::Rg16Float => MTLPixelFormat::RG16Float,
        Format::Rgba16Float => MTLPixelFormat::RGBA16Float,
        Format::R32Float => MTLPixelFormat::R32Float,
        Format::Rg32Float => MTLPixelFormat::RG32Float,
        Format::Rgba32Float => MTLPixelFormat::RGBA32Float,
        Format::R32Uint => MTLPixelFormat::R32Uint,
        Format::D32Float => MTLPixelFormat::Depth32Float,
        Format::D24UnormS8Uint => MTLPixelFormat::Depth24Unorm_Stencil8,
    }
}

/// `CAMetalLayer` 只接受少数几种格式，其余回退到 BGRA8
pub(super) fn layer_format(format: Format) -> MTLPixelFormat {
    match format {
        Format::Bgra8Unorm | Format::Bgra8Srgb | Format::Rgba16Float => pixel_format(format),
        Format::Rgba8Srgb => MTLPixelFormat::BGRA8Unorm_sRGB,
        _ => MTLPixelFormat::BGRA8Unorm,
    }
}

pub(super) fn vertex_format(format: Format) -> MTLVertexFormat {
    match format {
        Format::R8Unorm => MTLVertexFormat::UCharNormalized,
        Format::Rg8Unorm => MTLVertexFormat::UChar2Normalized,
        Format::Rgba8Unorm | Format::Rgba8Srgb => MTLVertexFormat::UChar4Normalized,
        Format::R16Float => MTLVertexFormat::Half,
        Format::Rg16Float => MTLVertexFormat::Half2,
        Format::Rgba16Float => MTLVertexFormat::Half4,
        Format::R32Float => MTLVertexFormat::Float,
        Format::Rg32Float => MTLVertexFormat::Float2,
        Format::Rgb32Float => MTLVertexFormat::Float3,
        Format::Rgba32Float => MTLVertexFormat::Float4,
        Format::R32Uint => MTLVertexFormat::UInt,
        _ => MTLVertexFormat::Invalid,
    }
}

pub(super) fn texture_usage(usage: TextureUsage) -> MTLTextureUsage {
    let mut flags = MTLTextureUsage::Unknown;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= MTLTextureUsage::ShaderRead;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= MTLTextureUsage::ShaderRead | MTLTextureUsage::ShaderWrite;
    }
    if usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_STENCIL) {
        flags |= MTLTextureUsage::RenderTarget;
    }
    flags
}

pub(super) fn load_action(op: LoadOp) -> MTLLoadAction {
    match op {
        LoadOp::Load => MTLLoadAction::Load,
        LoadOp::Clear => MTLLoadAction::Clear,
        LoadOp::DontCare => MTLLoadAction::DontCare,
    }
}

pub(super) fn store_action(op: StoreOp) -> MTLStoreAction {
    match op {
        StoreOp::Store => MTLStoreAction::Store,
        StoreOp::DontCare => MTLStoreAction::DontCare,
    }
}

pub(super) fn primitive_type(topology: PrimitiveTopology) -> MTLPrimitiveType {
    match topology {
        PrimitiveTopology::PointList => MTLPrimitiveType::Point,
        PrimitiveTopology::LineList => MTLPrimitiveType::Line,
        PrimitiveTopology::TriangleList => MTLPrimitiveType::Triangle,
        PrimitiveTopology::TriangleStrip => MTLPrimitiveType::TriangleStrip,
    }
}

pub(super) fn cull_mode(mode: CullMode) -> MTLCullMode {
    match mode {
        CullMode::None => MTLCullMode::None,
        CullMode::Front => MTLCullMode::Front,
        CullMode::Back => MTLCullMode::Back,
    }
}

pub(super) fn winding(face: FrontFace) -> MTLWinding {
    match face {
        FrontFace::CounterClockwise => MTLWinding::CounterClockwise,
        FrontFace::Clockwise => MTLWinding::Clockwise,
    }
}

pub(super) fn index_type(index_type: IndexType) -> MTLIndexType {
    match index_type {
        IndexType::U16 => MTLIndexType::UInt16,
        IndexType::U32 => MTLIndexType::UInt32,
    }
}

pub(super) fn compare(op: CompareOp) -> MTLCompareFunction {
    match op {
        CompareOp::Never => MTLCompareFunction::Never,
        CompareOp::Less => MTLCompareFunction::Less,
        CompareOp::Equal => MTLCompareFunction::Equal,
        CompareOp::LessOrEqual => MTLCompareFunction::LessEqual,
        CompareOp::Greater => MTLCompareFunction::Greater,
        CompareOp::NotEqual => MTLCompareFunction::NotEqual,
        CompareOp::GreaterOrEqual => MTLCompareFunction::GreaterEqual,
        CompareOp::Always => MTLCompareFunction::Always,
    }
}

pub(super) fn min_mag_filter(filter: Filter) -> MTLSamplerMinMagFilter {
    match filter {
        Filter::Nearest => MTLSamplerMinMagFilter::Nearest,
        Filter::Linear => MTLSamplerMinMagFilter::Linear,
    }
}

pub(super) fn mip_filter(filter: Filter) -> MTLSamplerMipFilter {
    match filter {
        Filter::Nearest => MTLSamplerMipFilter::Nearest,
        Filter::Linear => MTLSamplerMipFilter::Linear,
    }
}

pub(super) fn address_mode(mode: AddressMode) -> MTLSamplerAddressMode {
    match mode {
        AddressMode::Repeat => MTLSamplerAddressMode::Repeat,
        AddressMode::MirroredRepeat => MTLSamplerAddressMode::MirrorRepeat,
        AddressMode::ClampToEdge => MTLSamplerAddressMode::ClampToEdge,
        AddressMode::ClampToBorder => MTLSamplerAddressMode::ClampToBorderColor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_format_fallback() {
        assert_eq!(layer_format(Format::Rgba8Srgb), MTLPixelFormat::BGRA8Unorm_sRGB);
        assert_eq!(layer_format(Format::R32Float), MTLPixelFormat::BGRA8Unorm);
        assert_eq!(layer_format(Format::Rgba16Float), MTLPixelFormat::RGBA16Float);
    }

    #[test]
    fn test_attachment_usage_maps_to_render_target() {
        let usage = texture_usage(TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED);
        assert!(usage.contains(MTLTextureUsage::RenderTarget));
        assert!(usage.contains(MTLTextureUsage::ShaderRead));
        assert!(!usage.contains(MTLTextureUsage::ShaderWrite));
    }
}

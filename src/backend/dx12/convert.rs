//! 后端无关枚举到 D3D12 / DXGI 枚举的映射

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::command::ResourceState;
use crate::resource::{AddressMode, CompareOp, Filter, Format};
use crate::shader::{CullMode, PrimitiveTopology};

pub(super) fn format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Undefined => DXGI_FORMAT_UNKNOWN,
        Format::R8Unorm => DXGI_FORMAT_R8_UNORM,
        Format::Rg8Unorm => DXGI_FORMAT_R8G8_UNORM,
        Format::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::Rgba8Srgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        Format::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::Bgra8Srgb => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        Format::R16Float => DXGI_FORMAT_R16_FLOAT,
        Format::Rg16Float => DXGI_FORMAT_R16G16_FLOAT,
        Format::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        Format::R32Float => DXGI_FORMAT_R32_FLOAT,
        Format::Rg32Float => DXGI_FORMAT_R32G32_FLOAT,
        Format::Rgb32Float => DXGI_FORMAT_R32G32B32_FLOAT,
        Format::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        Format::R32Uint => DXGI_FORMAT_R32_UINT,
        Format::D32Float => DXGI_FORMAT_D32_FLOAT,
        Format::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
    }
}

/// 深度格式在着色器中读取时使用的格式
pub(super) fn srv_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::D32Float => DXGI_FORMAT_R32_FLOAT,
        Format::D24UnormS8Uint => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        other => self::format(other),
    }
}

/// 既要作深度附件又要采样的纹理使用的资源格式
pub(super) fn typeless(format: Format) -> DXGI_FORMAT {
    match format {
        Format::D32Float => DXGI_FORMAT_R32_TYPELESS,
        Format::D24UnormS8Uint => DXGI_FORMAT_R24G8_TYPELESS,
        other => self::format(other),
    }
}

/// 交换链只接受非 sRGB 格式，sRGB 通过 RTV 格式表达
pub(super) fn swapchain_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Rgba8Srgb => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::Bgra8Srgb => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::Rgba8Unorm | Format::Bgra8Unorm | Format::Rgba16Float => self::format(format),
        _ => DXGI_FORMAT_B8G8R8A8_UNORM,
    }
}

pub(super) fn state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Undefined | ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::VertexBuffer | ResourceState::ConstantBuffer => {
            D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER
        }
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::ShaderRead => {
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE
        }
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::DepthRead => D3D12_RESOURCE_STATE_DEPTH_READ,
        ResourceState::CopySrc => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::CopyDst => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::IndirectArgument => D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
    }
}

pub(super) fn topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
    }
}

pub(super) fn topology_type(topology: PrimitiveTopology) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        PrimitiveTopology::PointList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        PrimitiveTopology::LineList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
    }
}

pub(super) fn cull_mode(mode: CullMode) -> D3D12_CULL_MODE {
    match mode {
        CullMode::None => D3D12_CULL_MODE_NONE,
        CullMode::Front => D3D12_CULL_MODE_FRONT,
        CullMode::Back => D3D12_CULL_MODE_BACK,
    }
}

pub(super) fn compare(op: CompareOp) -> D3D12_COMPARISON_FUNC {
    match op {
        CompareOp::Never => D3D12_COMPARISON_FUNC_NEVER,
        CompareOp::Less => D3D12_COMPARISON_FUNC_LESS,
        CompareOp::Equal => D3D12_COMPARISON_FUNC_EQUAL,
        CompareOp::LessOrEqual => D3D12_COMPARISON_FUNC_LESS_EQUAL,
        CompareOp::Greater => D3D12_COMPARISON_FUNC_GREATER,
        CompareOp::NotEqual => D3D12_COMPARISON_FUNC_NOT_EQUAL,
        CompareOp::GreaterOrEqual => D3D12_COMPARISON_FUNC_GREATER_EQUAL,
        CompareOp::Always => D3D12_COMPARISON_FUNC_ALWAYS,
    }
}

pub(super) fn address_mode(mode: AddressMode) -> D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        AddressMode::Repeat => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::MirroredRepeat => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToEdge => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressMode::ClampToBorder => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

/// 由三个过滤方式组合出 D3D12 过滤器
pub(super) fn filter(min: Filter, mag: Filter, mip: Filter, anisotropic: bool, comparison: bool) -> D3D12_FILTER {
    let bit = |f: Filter| match f {
        Filter::Nearest => 0,
        Filter::Linear => 1,
    };
    // D3D12_FILTER 的编码：mip 位 0，mag 位 2，min 位 4，各向异性 0x55，比较 0x80
    let mut raw = if anisotropic { 0x55 } else { (bit(min) << 4) | (bit(mag) << 2) | bit(mip) };
    if comparison {
        raw |= 0x80;
    }
    D3D12_FILTER(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_encoding() {
        assert_eq!(
            filter(Filter::Linear, Filter::Linear, Filter::Linear, false, false),
            D3D12_FILTER_MIN_MAG_MIP_LINEAR
        );
        assert_eq!(
            filter(Filter::Nearest, Filter::Nearest, Filter::Nearest, false, false),
            D3D12_FILTER_MIN_MAG_MIP_POINT
        );
        assert_eq!(filter(Filter::Nearest, Filter::Nearest, Filter::Nearest, true, false), D3D12_FILTER_ANISOTROPIC);
        assert_eq!(
            filter(Filter::Linear, Filter::Linear, Filter::Linear, false, true),
            D3D12_FILTER_COMPARISON_MIN_MAG_MIP_LINEAR
        );
    }

    #[test]
    fn test_srgb_swapchain_formats_fall_back_to_unorm() {
        assert_eq!(swapchain_format(Format::Bgra8Srgb), DXGI_FORMAT_B8G8R8A8_UNORM);
        assert_eq!(swapchain_format(Format::Rgba16Float), DXGI_FORMAT_R16G16B16A16_FLOAT);
    }
}

//! DXGI 交换链

use raw_window_handle::RawWindowHandle;
use std::ffi::c_void;
use tracing::{debug, warn};
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::{convert, dx_error, Dx12Backend, Dx12Queue, Dx12Swapchain, DIRECT_FAMILY};
use crate::backend::PresentResult;
use crate::core::error::{GraphicsError, Result};
use crate::resource::Format;
use crate::swapchain::SwapchainDesc;

const DXGI_MAX_SWAP_CHAIN_BUFFERS: u32 = 16;

/// FLIP 模型要求至少两张图像
fn clamp_image_count(requested: u32) -> u32 {
    requested.clamp(2, DXGI_MAX_SWAP_CHAIN_BUFFERS)
}

/// 渲染目标视图的格式；sRGB 请求在这里体现，交换链本身保持 UNORM
fn rtv_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Rgba8Srgb | Format::Bgra8Srgb => convert::format(format),
        other => convert::swapchain_format(other),
    }
}

fn create_image_views(backend: &Dx12Backend, swapchain: &mut Dx12Swapchain) -> Result<()> {
    let mut images = Vec::with_capacity(swapchain.image_count as usize);
    for i in 0..swapchain.image_count {
        let image: ID3D12Resource =
            unsafe { swapchain.raw.GetBuffer(i) }.map_err(dx_error("IDXGISwapChain::GetBuffer"))?;
        let index = match swapchain.rtvs.get(i as usize) {
            Some(index) => *index,
            None => {
                let index = backend.rtv_heap.allocate(1)?;
                swapchain.rtvs.push(index);
                index
            }
        };
        let desc = D3D12_RENDER_TARGET_VIEW_DESC {
            Format: swapchain.rtv_format,
            ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
            Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_RTV { MipSlice: 0, PlaneSlice: 0 },
            },
        };
        unsafe {
            backend
                .device
                .CreateRenderTargetView(&image, Some(&desc), backend.rtv_heap.cpu_handle(index));
        }
        images.push(image);
    }
    swapchain.images = images;
    Ok(())
}

pub(super) fn create(
    backend: &Dx12Backend,
    window: RawWindowHandle,
    desc: &SwapchainDesc,
    present_queue: &Dx12Queue,
) -> Result<Dx12Swapchain> {
    let RawWindowHandle::Win32(handle) = window else {
        return Err(GraphicsError::SwapchainError(format!("unsupported window handle for DX12: {:?}", window)).into());
    };
    if present_queue.family != DIRECT_FAMILY {
        return Err(GraphicsError::SwapchainError("DX12 swapchains must present from a direct queue".into()).into());
    }

    let hwnd = HWND(handle.hwnd.get() as *mut c_void);
    let image_count = clamp_image_count(desc.image_count);
    let swapchain_desc = DXGI_SWAP_CHAIN_DESC1 {
        Width: desc.width,
        Height: desc.height,
        Format: convert::swapchain_format(desc.format),
        Stereo: false.into(),
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: image_count,
        Scaling: DXGI_SCALING_STRETCH,
        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
        AlphaMode: DXGI_ALPHA_MODE_UNSPECIFIED,
        Flags: 0,
    };

    let raw: IDXGISwapChain3 = unsafe {
        let swapchain = backend
            .factory
            .CreateSwapChainForHwnd(&present_queue.raw, hwnd, &swapchain_desc, None, None)
            .map_err(|e| GraphicsError::SwapchainError(format!("CreateSwapChainForHwnd failed: {}", e)))?;
        if let Err(e) = backend.factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) {
            warn!("MakeWindowAssociation failed: {}", e);
        }
        swapchain.cast().map_err(dx_error("IDXGISwapChain1::cast"))?
    };

    let mut swapchain = Dx12Swapchain {
        raw,
        images: Vec::new(),
        rtvs: Vec::new(),
        rtv_format: rtv_format(desc.format),
        width: desc.width,
        height: desc.height,
        vsync: desc.vsync,
        image_count,
    };
    if let Err(e) = create_image_views(backend, &mut swapchain) {
        for index in &swapchain.rtvs {
            backend.rtv_heap.free(*index, 1);
        }
        return Err(e);
    }

    debug!(width = desc.width, height = desc.height, images = image_count, "DX12 swapchain created");
    Ok(swapchain)
}

/// 调整缓冲区尺寸；调用前必须释放所有对旧图像的引用，RTV 复用原来的槽位
pub(super) fn resize(backend: &Dx12Backend, swapchain: &mut Dx12Swapchain, width: u32, height: u32) -> Result<()> {
    if swapchain.width == width && swapchain.height == height {
        return Ok(());
    }
    swapchain.images.clear();
    unsafe {
        swapchain
            .raw
            .ResizeBuffers(
                swapchain.image_count,
                width,
                height,
                DXGI_FORMAT_UNKNOWN,
                DXGI_SWAP_CHAIN_FLAG(0),
            )
            .map_err(|e| GraphicsError::SwapchainError(format!("ResizeBuffers failed: {}", e)))?;
    }
    swapchain.width = width;
    swapchain.height = height;
    create_image_views(backend, swapchain)?;

    debug!(width, height, "DX12 swapchain resized");
    Ok(())
}

pub(super) fn present(swapchain: &Dx12Swapchain) -> Result<PresentResult> {
    let sync_interval = u32::from(swapchain.vsync);
    let hr = unsafe { swapchain.raw.Present(sync_interval, DXGI_PRESENT(0)) };
    if hr == DXGI_ERROR_DEVICE_REMOVED || hr == DXGI_ERROR_DEVICE_RESET {
        return Err(GraphicsError::SwapchainError(format!("device lost during present: {:?}", hr)).into());
    }
    hr.ok().map_err(dx_error("IDXGISwapChain::Present"))?;
    Ok(PresentResult::Presented)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_count_is_clamped() {
        assert_eq!(clamp_image_count(0), 2);
        assert_eq!(clamp_image_count(3), 3);
        assert_eq!(clamp_image_count(64), 16);
    }

    #[test]
    fn test_srgb_request_keeps_srgb_view() {
        assert_eq!(rtv_format(Format::Bgra8Srgb), DXGI_FORMAT_B8G8R8A8_UNORM_SRGB);
        assert_eq!(rtv_format(Format::Rgba8Unorm), DXGI_FORMAT_R8G8B8A8_UNORM);
        assert_eq!(rtv_format(Format::R32Float), DXGI_FORMAT_B8G8R8A8_UNORM);
    }
}

//! 表面与交换链

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tracing::{debug, warn};

use super::{convert, vk_error, VulkanBackend, VulkanQueue, VulkanSemaphore, VulkanSwapchain};
use crate::backend::{AcquireResult, PresentResult};
use crate::core::error::{GraphicsError, Result};
use crate::swapchain::SwapchainDesc;

fn unsupported(window: RawWindowHandle) -> GraphicsError {
    GraphicsError::SwapchainError(format!("unsupported window handle for Vulkan: {:?}", window))
}

/// 由原生窗口句柄创建表面
fn create_surface(backend: &VulkanBackend, window: RawWindowHandle, display: RawDisplayHandle) -> Result<vk::SurfaceKHR> {
    let entry = &backend.ctx.entry;
    let instance = &backend.ctx.instance;

    let surface = match (window, display) {
        #[cfg(target_os = "windows")]
        (RawWindowHandle::Win32(handle), _) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0);
            let info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(handle.hwnd.get() as vk::HWND);
            unsafe { khr::Win32Surface::new(entry, instance).create_win32_surface(&info, None) }
        }
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        (RawWindowHandle::Xlib(handle), RawDisplayHandle::Xlib(display)) => {
            let Some(dpy) = display.display else {
                return Err(unsupported(window).into());
            };
            let info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(handle.window);
            unsafe { khr::XlibSurface::new(entry, instance).create_xlib_surface(&info, None) }
        }
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        (RawWindowHandle::Xcb(handle), RawDisplayHandle::Xcb(display)) => {
            let Some(connection) = display.connection else {
                return Err(unsupported(window).into());
            };
            let info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut vk::xcb_connection_t)
                .window(handle.window.get());
            unsafe { khr::XcbSurface::new(entry, instance).create_xcb_surface(&info, None) }
        }
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        (RawWindowHandle::Wayland(handle), RawDisplayHandle::Wayland(display)) => {
            let info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(handle.surface.as_ptr() as *mut vk::wl_surface);
            unsafe { khr::WaylandSurface::new(entry, instance).create_wayland_surface(&info, None) }
        }
        _ => return Err(unsupported(window).into()),
    };

    surface.map_err(vk_error("vkCreateSurfaceKHR"))
}

fn choose_format(formats: &[vk::SurfaceFormatKHR], wanted: vk::Format) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return vk::Extent2D {
            width: caps.current_extent.width.max(1),
            height: caps.current_extent.height.max(1),
        };
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width.max(1), caps.max_image_extent.width.max(1)),
        height: height.clamp(caps.min_image_extent.height.max(1), caps.max_image_extent.height.max(1)),
    }
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, wanted: u32) -> u32 {
    let count = wanted.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// 在同一个表面上（重新）创建交换链与图像视图
fn build(
    backend: &VulkanBackend,
    swapchain: &mut VulkanSwapchain,
    width: u32,
    height: u32,
    wanted_format: vk::Format,
) -> Result<()> {
    let physical_device = backend.ctx.physical_device;
    let loader = &backend.surface_loader;

    let (caps, formats, modes) = unsafe {
        (
            loader
                .get_physical_device_surface_capabilities(physical_device, swapchain.surface)
                .map_err(vk_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?,
            loader
                .get_physical_device_surface_formats(physical_device, swapchain.surface)
                .map_err(vk_error("vkGetPhysicalDeviceSurfaceFormatsKHR"))?,
            loader
                .get_physical_device_surface_present_modes(physical_device, swapchain.surface)
                .map_err(vk_error("vkGetPhysicalDeviceSurfacePresentModesKHR"))?,
        )
    };

    let format = choose_format(&formats, wanted_format)
        .ok_or_else(|| GraphicsError::SwapchainError("surface reports no formats".into()))?;
    if format.format != wanted_format {
        warn!(wanted = ?wanted_format, using = ?format.format, "Swapchain format not supported by the surface");
    }
    let present_mode = choose_present_mode(&modes, swapchain.vsync);
    let extent = choose_extent(&caps, width, height);
    let image_count = choose_image_count(&caps, swapchain.image_count);
    let usage = (vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
        & caps.supported_usage_flags;
    let composite = [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    ]
    .into_iter()
    .find(|flag| caps.supported_composite_alpha.contains(*flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

    let old = swapchain.raw;
    let info = vk::SwapchainCreateInfoKHR::builder()
        .surface(swapchain.surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(usage | vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(composite)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old);

    let device = backend.device();
    let raw = unsafe { backend.swapchain_loader.create_swapchain(&info, None) }.map_err(vk_error("vkCreateSwapchainKHR"))?;

    destroy_views(backend, swapchain);
    if old != vk::SwapchainKHR::null() {
        unsafe { backend.swapchain_loader.destroy_swapchain(old, None) };
    }
    swapchain.raw = raw;

    let images = unsafe { backend.swapchain_loader.get_swapchain_images(raw) }.map_err(vk_error("vkGetSwapchainImagesKHR"))?;
    let mut views = Vec::with_capacity(images.len());
    for &image in &images {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                swapchain.views = views;
                destroy_views(backend, swapchain);
                return Err(vk_error("vkCreateImageView")(e));
            }
        }
    }

    debug!(
        images = images.len(),
        width = extent.width,
        height = extent.height,
        format = ?format.format,
        mode = ?present_mode,
        "Vulkan swapchain built"
    );

    swapchain.written = images.iter().map(|_| AtomicU64::new(u64::MAX)).collect();
    swapchain.images = images;
    swapchain.views = views;
    swapchain.format = format.format;
    swapchain.extent = extent;
    Ok(())
}

fn destroy_views(backend: &VulkanBackend, swapchain: &mut VulkanSwapchain) {
    for view in swapchain.views.drain(..) {
        unsafe { backend.device().destroy_image_view(view, None) };
    }
}

pub(super) fn create(
    backend: &VulkanBackend,
    window: RawWindowHandle,
    display: RawDisplayHandle,
    desc: &SwapchainDesc,
    present_queue: &VulkanQueue,
) -> Result<VulkanSwapchain> {
    let surface = create_surface(backend, window, display)?;

    let supported = unsafe {
        backend.surface_loader.get_physical_device_surface_support(
            backend.ctx.physical_device,
            present_queue.family,
            surface,
        )
    };
    if !matches!(supported, Ok(true)) {
        unsafe { backend.surface_loader.destroy_surface(surface, None) };
        return Err(GraphicsError::SwapchainError(format!(
            "queue family {} cannot present to this surface",
            present_queue.family
        ))
        .into());
    }

    let mut swapchain = VulkanSwapchain {
        surface,
        raw: vk::SwapchainKHR::null(),
        images: Vec::new(),
        views: Vec::new(),
        format: vk::Format::UNDEFINED,
        extent: vk::Extent2D::default(),
        vsync: desc.vsync,
        image_count: desc.image_count,
        written: Vec::new(),
    };
    if let Err(e) = build(backend, &mut swapchain, desc.width, desc.height, convert::format(desc.format)) {
        destroy(backend, swapchain);
        return Err(e);
    }
    Ok(swapchain)
}

pub(super) fn resize(backend: &VulkanBackend, swapchain: &mut VulkanSwapchain, width: u32, height: u32) -> Result<()> {
    let format = swapchain.format;
    build(backend, swapchain, width, height, format)
}

pub(super) fn destroy(backend: &VulkanBackend, mut swapchain: VulkanSwapchain) {
    destroy_views(backend, &mut swapchain);
    unsafe {
        if swapchain.raw != vk::SwapchainKHR::null() {
            backend.swapchain_loader.destroy_swapchain(swapchain.raw, None);
        }
        backend.surface_loader.destroy_surface(swapchain.surface, None);
    }
}

pub(super) fn acquire(
    backend: &VulkanBackend,
    swapchain: &mut VulkanSwapchain,
    signal: &VulkanSemaphore,
    timeout: Duration,
) -> Result<AcquireResult> {
    let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    let result = unsafe {
        backend
            .swapchain_loader
            .acquire_next_image(swapchain.raw, timeout, signal.raw, vk::Fence::null())
    };
    match result {
        Ok((image, false)) => Ok(AcquireResult::Acquired(image)),
        Ok((image, true)) => Ok(AcquireResult::Suboptimal(image)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireResult::Timeout),
        Err(e) => Err(vk_error("vkAcquireNextImageKHR")(e)),
    }
}

pub(super) fn present(
    backend: &VulkanBackend,
    queue: &VulkanQueue,
    swapchain: &VulkanSwapchain,
    image: u32,
    waits: &[&VulkanSemaphore],
) -> Result<PresentResult> {
    let wait_semaphores: Vec<vk::Semaphore> = waits.iter().map(|s| s.raw).collect();
    let swapchains = [swapchain.raw];
    let indices = [image];
    let info = vk::PresentInfoKHR::builder()
        .wait_semaphores(&wait_semaphores)
        .swapchains(&swapchains)
        .image_indices(&indices);

    match unsafe { backend.swapchain_loader.queue_present(queue.raw, &info) } {
        Ok(false) => Ok(PresentResult::Presented),
        Ok(true) => Ok(PresentResult::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::OutOfDate),
        Err(e) => Err(vk_error("vkQueuePresentKHR")(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn test_extent_follows_surface_when_fixed() {
        let fixed = caps((800, 600), 2, 8);
        assert_eq!(choose_extent(&fixed, 1024, 768), vk::Extent2D { width: 800, height: 600 });

        let free = caps((u32::MAX, u32::MAX), 2, 8);
        assert_eq!(choose_extent(&free, 8000, 0), vk::Extent2D { width: 4096, height: 1 });
    }

    #[test]
    fn test_image_count_clamped() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 3), 8), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0), 8), 8);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0), 1), 2);
    }

    #[test]
    fn test_present_mode_selection() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_format_fallback() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(choose_format(&formats, vk::Format::B8G8R8A8_UNORM).map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
        assert!(choose_format(&[], vk::Format::B8G8R8A8_UNORM).is_none());
    }
}

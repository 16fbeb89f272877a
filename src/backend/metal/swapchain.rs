//! `CAMetalLayer` 交换链

use ::metal::{MetalDrawable, MetalLayer};
use core_graphics_types::geometry::CGSize;
use objc::rc::autoreleasepool;
use objc::runtime::YES;
use raw_window_handle::RawWindowHandle;
use tracing::{debug, warn};

use super::{convert, MetalBackend, MetalQueue};
use crate::backend::{AcquireResult, PresentResult};
use crate::core::error::{GraphicsError, Result};
use crate::resource::Format;
use crate::swapchain::SwapchainDesc;

/// `CAMetalLayer` 只允许 2 或 3 个可绘制对象
fn clamp_drawable_count(requested: u32) -> u32 {
    requested.clamp(2, 3)
}

pub struct MetalSwapchain {
    layer: MetalLayer,
    /// 按获取顺序轮换的槽位，只有最近一次获取的槽位非空
    pub(super) drawables: Vec<Option<MetalDrawable>>,
    next: usize,
    pub(super) format: Format,
    width: u32,
    height: u32,
}

pub(super) fn create(
    backend: &MetalBackend,
    window: RawWindowHandle,
    desc: &SwapchainDesc,
    _present_queue: &MetalQueue,
) -> Result<MetalSwapchain> {
    let RawWindowHandle::AppKit(handle) = window else {
        return Err(GraphicsError::SwapchainError(format!("unsupported window handle for Metal: {:?}", window)).into());
    };

    let drawable_count = clamp_drawable_count(desc.image_count);
    let layer = MetalLayer::new();
    layer.set_device(&backend.device);
    layer.set_pixel_format(convert::layer_format(desc.format));
    layer.set_presents_with_transaction(false);
    layer.set_maximum_drawable_count(u64::from(drawable_count));
    layer.set_display_sync_enabled(desc.vsync);
    // 允许拷贝进交换链图像
    layer.set_framebuffer_only(false);
    layer.set_drawable_size(CGSize::new(f64::from(desc.width), f64::from(desc.height)));

    unsafe {
        use cocoa::appkit::NSView;
        let view = handle.ns_view.as_ptr() as cocoa::base::id;
        view.setWantsLayer(YES);
        view.setLayer(layer.as_ref() as *const _ as _);
    }

    debug!(width = desc.width, height = desc.height, drawables = drawable_count, "Metal swapchain created");
    Ok(MetalSwapchain {
        layer,
        drawables: (0..drawable_count).map(|_| None).collect(),
        next: 0,
        format: desc.format,
        width: desc.width,
        height: desc.height,
    })
}

pub(super) fn resize(swapchain: &mut MetalSwapchain, width: u32, height: u32) {
    if swapchain.width == width && swapchain.height == height {
        return;
    }
    swapchain.drawables.iter_mut().for_each(|slot| *slot = None);
    swapchain
        .layer
        .set_drawable_size(CGSize::new(f64::from(width), f64::from(height)));
    swapchain.width = width;
    swapchain.height = height;
    debug!(width, height, "Metal swapchain resized");
}

/// 取下一个可绘制对象
///
/// 之前获取的对象在这里释放；图层的对象池很小，持有不放会让 `nextDrawable` 一直阻塞。
pub(super) fn acquire(swapchain: &mut MetalSwapchain) -> AcquireResult {
    swapchain.drawables.iter_mut().for_each(|slot| *slot = None);
    let drawable = autoreleasepool(|| swapchain.layer.next_drawable().map(|d| d.to_owned()));
    let Some(drawable) = drawable else {
        warn!("CAMetalLayer returned no drawable");
        return AcquireResult::Timeout;
    };

    let index = swapchain.next;
    swapchain.next = (swapchain.next + 1) % swapchain.drawables.len();
    let texture = drawable.texture();
    let matches = texture.width() == u64::from(swapchain.width) && texture.height() == u64::from(swapchain.height);
    swapchain.drawables[index] = Some(drawable);
    if matches {
        AcquireResult::Acquired(index as u32)
    } else {
        AcquireResult::Suboptimal(index as u32)
    }
}

pub(super) fn present(queue: &MetalQueue, swapchain: &MetalSwapchain, image: u32) -> Result<PresentResult> {
    let drawable = swapchain
        .drawables
        .get(image as usize)
        .and_then(Option::as_ref)
        .ok_or_else(|| GraphicsError::SwapchainError(format!("image {} was not acquired", image)))?;
    autoreleasepool(|| {
        let command_buffer = queue.raw.new_command_buffer();
        command_buffer.present_drawable(drawable);
        command_buffer.commit();
    });
    Ok(PresentResult::Presented)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drawable_count_is_clamped() {
        assert_eq!(clamp_drawable_count(1), 2);
        assert_eq!(clamp_drawable_count(3), 3);
        assert_eq!(clamp_drawable_count(8), 3);
    }
}

//! 交换链描述与设备侧的交换链记录

use crate::backend::Backend;
use crate::handle::{QueueHandle, SwapchainHandle, TextureHandle};
use crate::resource::Format;

/// 交换链创建参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub image_count: u32,
    pub vsync: bool,
}

impl SwapchainDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: Format::Bgra8Unorm,
            image_count: 3,
            vsync: true,
        }
    }

    pub fn has_extent(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// 本帧要呈现的交换链
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentDesc {
    pub swapchains: Vec<SwapchainHandle>,
}

impl PresentDesc {
    pub fn new(swapchains: &[SwapchainHandle]) -> Self {
        Self { swapchains: swapchains.to_vec() }
    }
}

/// 设备持有的交换链状态
pub(crate) struct SwapchainEntry<B: Backend> {
    pub native: B::Swapchain,
    pub desc: SwapchainDesc,
    /// 解析为本帧获取到的图像的代理纹理
    pub texture: TextureHandle,
    pub active: bool,
    pub present_queue: QueueHandle,
    /// 每个飞行帧一个“图像已获取”二值信号量
    pub image_acquired: Vec<B::Semaphore>,
    pub current_image: Option<u32>,
    /// 本帧是否已有提交等待过 `image_acquired`
    pub acquire_waited: bool,
    /// 本帧写入该交换链的提交所触发的二值信号量：(队列, 池内下标)
    pub present_waits: Vec<(QueueHandle, usize)>,
}

impl<B: Backend> SwapchainEntry<B> {
    /// 清除上一帧的获取 / 写入记录
    pub fn reset_frame(&mut self) {
        self.current_image = None;
        self.acquire_waited = false;
        self.present_waits.clear();
    }

    /// 本帧是否可以呈现
    pub fn is_presentable(&self) -> bool {
        self.active && self.desc.has_extent() && self.current_image.is_some()
    }
}

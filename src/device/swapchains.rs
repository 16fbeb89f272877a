//! 交换链管理

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info};

use super::tables::TextureEntry;
use super::Device;
use crate::backend::{Backend, SemaphoreKind};
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::{lock, read};
use crate::handle::{SwapchainHandle, TextureHandle};
use crate::queue::QueueType;
use crate::swapchain::{SwapchainDesc, SwapchainEntry};

impl<B: Backend> Device<B> {
    fn create_acquire_semaphores(&self) -> Result<Vec<B::Semaphore>> {
        let mut semaphores = Vec::with_capacity(self.frames_in_flight());
        for _ in 0..self.frames_in_flight() {
            match self.backend.create_semaphore(SemaphoreKind::Binary) {
                Ok(semaphore) => semaphores.push(semaphore),
                Err(e) => {
                    for semaphore in semaphores {
                        self.backend.destroy_semaphore(semaphore);
                    }
                    return Err(e);
                }
            }
        }
        Ok(semaphores)
    }

    /// 为窗口创建交换链
    ///
    /// # 参数
    ///
    /// * `window` - 提供原生窗口 / 显示句柄的窗口对象
    /// * `desc` - 尺寸、格式、图像数量与垂直同步
    ///
    /// # 返回值
    ///
    /// 交换链句柄；通过 `swapchain_texture` 取得可在命令流中作为渲染目标的代理纹理
    pub fn create_swapchain<W>(&self, window: &W, desc: &SwapchainDesc) -> Result<SwapchainHandle>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window
            .window_handle()
            .map_err(|e| GraphicsError::SwapchainError(e.to_string()))?
            .as_raw();
        let display_handle = window
            .display_handle()
            .map_err(|e| GraphicsError::SwapchainError(e.to_string()))?
            .as_raw();

        let _guard = self.creation_guard();
        let present_queue = self.primary_queue(QueueType::Graphics);
        let native = {
            let queues = read(&self.queues);
            let state = queues
                .get(present_queue)
                .ok_or_else(|| GraphicsError::InvalidHandle("present queue".into()))?;
            let native_queue = &self.native_queues[lock(state).native].queue;
            self.backend
                .create_swapchain(window_handle, display_handle, desc, native_queue)?
        };

        let image_acquired = match self.create_acquire_semaphores() {
            Ok(semaphores) => semaphores,
            Err(e) => {
                self.backend.destroy_swapchain(native);
                return Err(e);
            }
        };

        let mut resources = lock(&self.resources);
        let mut swapchains = lock(&self.swapchains);
        let handle = swapchains.add(SwapchainEntry {
            native,
            desc: *desc,
            texture: TextureHandle::INVALID,
            active: true,
            present_queue,
            image_acquired,
            current_image: None,
            acquire_waited: false,
            present_waits: Vec::new(),
        });
        let texture = resources.textures.add(TextureEntry::Swapchain(handle));
        if let Some(entry) = swapchains.get_mut(handle) {
            entry.texture = texture;
        }

        info!(?handle, width = desc.width, height = desc.height, format = ?desc.format, "Swapchain created");
        Ok(handle)
    }

    /// 调整交换链尺寸
    ///
    /// 先等待所有队列空闲；尺寸为 0（窗口最小化）时只记录尺寸，交换链在此期间不参与获取与呈现。
    pub fn resize_swapchain(&self, handle: SwapchainHandle, width: u32, height: u32) -> Result<()> {
        self.join()?;

        let _guard = self.creation_guard();
        let mut swapchains = lock(&self.swapchains);
        let entry = swapchains
            .get_mut(handle)
            .ok_or_else(|| GraphicsError::InvalidHandle(format!("{:?}", handle)))?;

        entry.desc.width = width;
        entry.desc.height = height;
        entry.reset_frame();
        if !entry.desc.has_extent() {
            debug!(?handle, "Swapchain minimized");
            return Ok(());
        }

        self.backend.resize_swapchain(&mut entry.native, width, height)?;

        // 获取信号量可能停留在已触发状态，重建交换链后一并替换
        let fresh = self.create_acquire_semaphores()?;
        for semaphore in std::mem::replace(&mut entry.image_acquired, fresh) {
            self.backend.destroy_semaphore(semaphore);
        }

        info!(?handle, width, height, "Swapchain resized");
        Ok(())
    }

    /// 激活 / 停用交换链；停用的交换链不参与获取与呈现
    pub fn set_swapchain_active(&self, handle: SwapchainHandle, active: bool) {
        match lock(&self.swapchains).get_mut(handle) {
            Some(entry) => entry.active = active,
            None => error!(?handle, "Invalid swapchain handle"),
        }
    }

    /// 交换链的代理纹理，解析为本帧获取到的图像
    pub fn swapchain_texture(&self, handle: SwapchainHandle) -> TextureHandle {
        match lock(&self.swapchains).get(handle) {
            Some(entry) => entry.texture,
            None => {
                error!(?handle, "Invalid swapchain handle");
                TextureHandle::INVALID
            }
        }
    }

    pub fn swapchain_desc(&self, handle: SwapchainHandle) -> Option<SwapchainDesc> {
        lock(&self.swapchains).get(handle).map(|e| e.desc)
    }

    /// 本帧获取到的图像下标
    pub fn swapchain_image(&self, handle: SwapchainHandle) -> Option<u32> {
        lock(&self.swapchains).get(handle).and_then(|e| e.current_image)
    }

    /// 销毁交换链及其代理纹理
    ///
    /// 调用方需要保证没有仍在执行的 GPU 工作引用它。
    pub fn destroy_swapchain(&self, handle: SwapchainHandle) {
        let _guard = self.creation_guard();
        let mut resources = lock(&self.resources);
        let Some(entry) = lock(&self.swapchains).remove(handle) else {
            error!(?handle, "Destroying an invalid swapchain handle");
            return;
        };
        resources.textures.remove(entry.texture);
        for semaphore in entry.image_acquired {
            self.backend.destroy_semaphore(semaphore);
        }
        self.backend.destroy_swapchain(entry.native);
    }
}

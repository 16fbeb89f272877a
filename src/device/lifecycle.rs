//! 帧生命周期
//!
//! 每个逻辑帧按顺序调用：
//!
//! `start_frame` -> 录制 -> `close_command_streams` -> `submit` -> `present` -> `end_frame`

use tracing::{trace, warn};

use super::Device;
use crate::backend::{AcquireResult, Backend, WaitStatus};
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::{lock, read, write};
use crate::gpu_fatal;

impl<B: Backend> Device<B> {
    /// 开始一帧
    ///
    /// 1. 等待当前飞行帧槽位上一轮提交的时间线值（CPU 最多领先 GPU `frames_in_flight` 帧）
    /// 2. 回收足够旧的暂存缓冲区
    /// 3. 为每个激活的交换链获取下一张图像
    ///
    /// 交换链过期或次优时返回错误，调用方需要在下一帧前重建交换链。
    /// 等待超时是致命错误。
    pub fn start_frame(&self) -> Result<()> {
        let frame = write(&self.frame);
        let frame_index = frame.frame_index();
        frame.reset_submissions();

        {
            let queues = read(&self.queues);
            let mut states: Vec<_> = queues.iter().map(|(_, q)| lock(q)).collect();
            {
                let waits: Vec<(&B::Semaphore, u64)> = states
                    .iter()
                    .filter(|q| q.frames[frame_index].used)
                    .map(|q| (&q.timeline, q.frames[frame_index].wait_value))
                    .collect();

                if !waits.is_empty() {
                    trace!(frame_index, queues = waits.len(), "Waiting for frame slot");
                    if let WaitStatus::Timeout = self.backend.wait_semaphores(&waits, self.sync_timeout())? {
                        gpu_fatal!(
                            "Timed out after {:?} waiting for frame slot {}",
                            self.sync_timeout(),
                            frame_index
                        );
                    }
                }
            }

            for state in states.iter_mut() {
                let slot = &mut state.frames[frame_index];
                slot.used = false;
                slot.cursor = 0;
            }
        }

        let mut first_error = None;
        {
            let mut swapchains = lock(&self.swapchains);
            for (handle, entry) in swapchains.iter_mut() {
                entry.reset_frame();
                if !entry.active || !entry.desc.has_extent() {
                    continue;
                }

                let result = self.backend.acquire_next_image(
                    &mut entry.native,
                    &entry.image_acquired[frame_index],
                    self.sync_timeout(),
                )?;
                match result {
                    AcquireResult::Acquired(image) => entry.current_image = Some(image),
                    AcquireResult::Suboptimal(image) => {
                        entry.current_image = Some(image);
                        warn!(?handle, "Swapchain is suboptimal, recreate it before the next frame");
                        first_error.get_or_insert(GraphicsError::SwapchainSuboptimal(format!("{:?}", handle)));
                    }
                    AcquireResult::OutOfDate => {
                        warn!(?handle, "Swapchain is out of date, recreate it before the next frame");
                        first_error.get_or_insert(GraphicsError::SwapchainOutOfDate(format!("{:?}", handle)));
                    }
                    AcquireResult::Timeout => {
                        gpu_fatal!("Timed out acquiring an image from swapchain {:?}", handle);
                    }
                }
            }
        }

        {
            let mut streams = lock(&self.streams);
            for (handle, slot) in streams.iter_mut() {
                let before = slot.intermediates.len();
                let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut slot.intermediates)
                    .into_iter()
                    .partition(|(created, _)| frame.is_expired(*created));
                slot.intermediates = live;
                for (_, buffer) in expired {
                    self.backend.destroy_buffer(buffer);
                }
                if slot.intermediates.len() != before {
                    trace!(?handle, released = before - slot.intermediates.len(), "Intermediates reclaimed");
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// 结束一帧：飞行帧下标取模递增，总帧计数加一
    pub fn end_frame(&self) {
        write(&self.frame).advance();
    }
}

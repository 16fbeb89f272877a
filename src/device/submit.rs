//! 提交与呈现

use std::sync::MutexGuard;
use tracing::{debug, error, trace, warn};

use super::{Device, QueueState};
use crate::backend::{Backend, PresentResult, SemaphoreKind, SemaphoreSubmit, SubmitBatch};
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::{lock, read};
use crate::handle::{QueueHandle, SwapchainHandle};
use crate::queue::{QueueType, SubmitDesc};
use crate::swapchain::PresentDesc;

impl<B: Backend> Device<B> {
    /// 从本帧的二值信号量池中取出一个，池不够时扩充
    fn take_submit_semaphore(&self, queue: &mut QueueState<B>, frame_index: usize) -> Result<usize> {
        let frame = &mut queue.frames[frame_index];
        if frame.cursor == frame.submit_semaphores.len() {
            frame
                .submit_semaphores
                .push(self.backend.create_semaphore(SemaphoreKind::Binary)?);
        }
        frame.cursor += 1;
        Ok(frame.cursor - 1)
    }

    /// 把已关闭的命令流提交到队列
    ///
    /// 每次调用恰好产生一次原生提交：
    ///
    /// - 等待：本帧首次写入的交换链的“图像已获取”信号量，以及用户信号量
    /// - 触发：队列自身时间线的下一个值、写入交换链时的一个二值信号量，以及用户信号量
    ///
    /// 超出每帧提交上限是致命错误。
    pub fn submit(&self, desc: &SubmitDesc) -> Result<()> {
        let frame = read(&self.frame);
        let frame_index = frame.frame_index();
        let total_frames = frame.total_frames();

        let queues = read(&self.queues);
        let Some(queue) = queues.get(desc.queue) else {
            error!(queue = ?desc.queue, "Submitting to an invalid queue handle");
            return Err(GraphicsError::InvalidHandle(format!("{:?}", desc.queue)).into());
        };
        let mut swapchains = lock(&self.swapchains);
        let mut queue = lock(queue);
        if queue.ty == QueueType::Secondary {
            error!(queue = ?desc.queue, "Secondary queues are not submission targets");
            return Err(GraphicsError::CommandExecution("secondary queue is not submittable".into()).into());
        }

        let streams = lock(&self.streams);
        let mut command_lists = Vec::with_capacity(desc.streams.len());
        let mut touched: Vec<SwapchainHandle> = Vec::new();
        for &handle in &desc.streams {
            let Some(slot) = streams.get(handle) else {
                error!(?handle, "Submitting an invalid command stream handle");
                continue;
            };
            if slot.queue_type == QueueType::Secondary {
                error!(?handle, "Secondary command streams can only be executed from a primary stream");
                continue;
            }
            if slot.family != queue.family {
                error!(
                    ?handle,
                    stream_family = slot.family,
                    queue_family = queue.family,
                    "Command stream was created for a different queue family"
                );
                return Err(GraphicsError::CommandExecution(format!(
                    "command stream {:?} does not match the family of queue {:?}",
                    handle, desc.queue
                ))
                .into());
            }
            if !slot.is_closed_in(total_frames) {
                error!(?handle, "Command stream was not closed this frame, skipping");
                continue;
            }
            if slot.recorded == 0 {
                warn!(?handle, "Submitting an empty command stream, skipping");
                continue;
            }
            let Some(list) = slot.lists[frame_index].as_ref() else {
                continue;
            };
            command_lists.push(list);
            for swapchain in &slot.touched_swapchains {
                if !touched.contains(swapchain) {
                    touched.push(*swapchain);
                }
            }
        }

        if command_lists.is_empty() && desc.waits.is_empty() && desc.signals.is_empty() {
            warn!(queue = ?desc.queue, "Nothing to submit");
            return Ok(());
        }

        let semaphores = read(&self.semaphores);
        if let Some(invalid) = desc
            .waits
            .iter()
            .chain(&desc.signals)
            .find(|s| !semaphores.contains(s.semaphore))
        {
            error!(semaphore = ?invalid.semaphore, "Submission references an invalid semaphore");
            return Err(GraphicsError::InvalidHandle(format!("{:?}", invalid.semaphore)).into());
        }

        frame.begin_submission();

        // 只有本帧获取到图像的交换链参与呈现同步
        touched.retain(|h| swapchains.get(*h).is_some_and(|e| e.current_image.is_some()));
        let binary = if touched.is_empty() {
            None
        } else {
            Some(self.take_submit_semaphore(&mut queue, frame_index)?)
        };

        let mut acquire_waits: Vec<SwapchainHandle> = Vec::new();
        for handle in &touched {
            if let Some(entry) = swapchains.get_mut(*handle) {
                if !entry.acquire_waited {
                    entry.acquire_waited = true;
                    acquire_waits.push(*handle);
                }
                if let Some(index) = binary {
                    entry.present_waits.push((desc.queue, index));
                }
            }
        }

        queue.frames[frame_index].used = true;
        let value = queue.value + 1;
        let caps = self.backend.queue_layout().family_caps(queue.family);

        let result = {
            let mut batch = SubmitBatch::<B> {
                command_lists,
                waits: Vec::new(),
                signals: Vec::new(),
            };

            for handle in &acquire_waits {
                if let Some(entry) = swapchains.get(*handle) {
                    batch.waits.push(SemaphoreSubmit {
                        semaphore: &entry.image_acquired[frame_index],
                        value: 0,
                        stage: caps.acquire_wait_stage(),
                    });
                }
            }
            for wait in &desc.waits {
                if let Some(semaphore) = semaphores.get(wait.semaphore) {
                    batch.waits.push(SemaphoreSubmit { semaphore, value: wait.value, stage: caps.wait_stage() });
                }
            }

            batch.signals.push(SemaphoreSubmit { semaphore: &queue.timeline, value, stage: caps.wait_stage() });
            if let Some(index) = binary {
                batch.signals.push(SemaphoreSubmit {
                    semaphore: &queue.frames[frame_index].submit_semaphores[index],
                    value: 0,
                    stage: caps.wait_stage(),
                });
            }
            for signal in &desc.signals {
                if let Some(semaphore) = semaphores.get(signal.semaphore) {
                    batch.signals.push(SemaphoreSubmit { semaphore, value: signal.value, stage: caps.wait_stage() });
                }
            }

            let native = &self.native_queues[queue.native];
            let _spin = native.lock.lock_if(self.config.graphics.multithreaded_submission);
            trace!(
                queue = ?desc.queue,
                lists = batch.command_lists.len(),
                waits = batch.waits.len(),
                signals = batch.signals.len(),
                value,
                "Submitting"
            );
            self.backend.submit(&native.queue, &batch)
        };

        result.map_err(|e| {
            error!(queue = ?desc.queue, "Queue submission failed: {}", e);
            e
        })?;

        queue.value = value;
        queue.frames[frame_index].wait_value = value;
        Ok(())
    }

    /// 呈现交换链
    ///
    /// 尺寸为 0、未激活或本帧没有获取到图像的交换链直接跳过。
    pub fn present(&self, desc: &PresentDesc) -> Result<()> {
        let frame_index = read(&self.frame).frame_index();
        let queues = read(&self.queues);
        let mut swapchains = lock(&self.swapchains);
        let mut first_error = None;

        for &handle in &desc.swapchains {
            let Some(entry) = swapchains.get(handle) else {
                error!(?handle, "Presenting an invalid swapchain handle");
                continue;
            };
            let Some(image) = entry.current_image.filter(|_| entry.is_presentable()) else {
                debug!(?handle, active = entry.active, "Swapchain skipped for presentation");
                continue;
            };

            let result = {
                let mut needed: Vec<QueueHandle> = entry.present_waits.iter().map(|(q, _)| *q).collect();
                needed.push(entry.present_queue);
                needed.sort();
                needed.dedup();
                let guards: Vec<(QueueHandle, MutexGuard<'_, QueueState<B>>)> = needed
                    .iter()
                    .filter_map(|q| queues.get(*q).map(|state| (*q, lock(state))))
                    .collect();

                let mut waits: Vec<&B::Semaphore> = entry
                    .present_waits
                    .iter()
                    .filter_map(|(queue, index)| {
                        guards
                            .iter()
                            .find(|(h, _)| h == queue)
                            .and_then(|(_, state)| state.frames[frame_index].submit_semaphores.get(*index))
                    })
                    .collect();
                if !entry.acquire_waited {
                    // 本帧没有提交写入它，直接消费获取信号量
                    waits.push(&entry.image_acquired[frame_index]);
                }

                let Some((_, present_queue)) = guards.iter().find(|(h, _)| *h == entry.present_queue) else {
                    error!(?handle, "Present queue of swapchain no longer exists");
                    continue;
                };
                let native = &self.native_queues[present_queue.native];
                let _spin = native.lock.lock_if(self.config.graphics.multithreaded_submission);
                self.backend.present(&native.queue, &entry.native, image, &waits)
            };

            if let Some(entry) = swapchains.get_mut(handle) {
                entry.reset_frame();
            }

            match result? {
                PresentResult::Presented => {}
                PresentResult::Suboptimal => {
                    warn!(?handle, "Swapchain is suboptimal, recreate it before the next frame");
                    first_error.get_or_insert(GraphicsError::SwapchainSuboptimal(format!("{:?}", handle)));
                }
                PresentResult::OutOfDate => {
                    warn!(?handle, "Swapchain is out of date, recreate it before the next frame");
                    first_error.get_or_insert(GraphicsError::SwapchainOutOfDate(format!("{:?}", handle)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

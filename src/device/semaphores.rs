//! 用户信号量
//!
//! 包装原生时间线信号量，独立于帧生命周期创建、等待和销毁。

use std::time::Duration;
use tracing::error;

use super::Device;
use crate::backend::{Backend, SemaphoreKind, WaitStatus};
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::{read, write};
use crate::handle::SemaphoreHandle;

impl<B: Backend> Device<B> {
    pub fn create_semaphore(&self, initial: u64) -> Result<SemaphoreHandle> {
        let _guard = self.creation_guard();
        let native = self.backend.create_semaphore(SemaphoreKind::Timeline { initial })?;
        Ok(write(&self.semaphores).add(native))
    }

    pub fn destroy_semaphore(&self, handle: SemaphoreHandle) {
        let _guard = self.creation_guard();
        match write(&self.semaphores).remove(handle) {
            Some(native) => self.backend.destroy_semaphore(native),
            None => error!(?handle, "Destroying an invalid semaphore handle"),
        }
    }

    /// 从 CPU 触发信号量到 `value`
    pub fn signal_semaphore(&self, handle: SemaphoreHandle, value: u64) -> Result<()> {
        let semaphores = read(&self.semaphores);
        let native = semaphores
            .get(handle)
            .ok_or_else(|| GraphicsError::InvalidHandle(format!("{:?}", handle)))?;
        self.backend.signal_semaphore(native, value)
    }

    /// 信号量当前的值
    pub fn semaphore_value(&self, handle: SemaphoreHandle) -> Result<u64> {
        let semaphores = read(&self.semaphores);
        let native = semaphores
            .get(handle)
            .ok_or_else(|| GraphicsError::InvalidHandle(format!("{:?}", handle)))?;
        self.backend.semaphore_value(native)
    }

    /// 阻塞直到信号量达到 `value` 或超时
    ///
    /// 等待期间持有信号量表的读锁，同一时刻不能创建或销毁用户信号量。
    pub fn wait_semaphore(&self, handle: SemaphoreHandle, value: u64, timeout: Duration) -> Result<WaitStatus> {
        let semaphores = read(&self.semaphores);
        let native = semaphores
            .get(handle)
            .ok_or_else(|| GraphicsError::InvalidHandle(format!("{:?}", handle)))?;
        self.backend.wait_semaphores(&[(native, value)], timeout)
    }
}

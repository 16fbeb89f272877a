//! CPU 侧同步工具
//!
//! - `SpinLock`：test-and-set 自旋锁，保护原生队列的提交调用
//! - `lock` / `read` / `write`：忽略锁中毒的加锁辅助函数

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// test-and-set 自旋锁
///
/// 只在持有时间极短的临界区使用（一次原生提交调用）。
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

/// 自旋锁守卫，离开作用域时释放
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false) }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }

    /// 只有 `enabled` 为真时才加锁
    pub fn lock_if(&self, enabled: bool) -> Option<SpinGuard<'_>> {
        enabled.then(|| self.lock())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// 某个线程在持锁时 panic 后，表格本身仍然完整（panic 只会出现在 gpu_fatal! 之后），
// 所以这里直接取回内部数据。
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_spin_lock_exclusive() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.lock();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_if_disabled() {
        let lock = SpinLock::new();
        assert!(lock.lock_if(false).is_none());
        assert!(!lock.is_locked());
        {
            let _g = lock.lock_if(true);
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }
}

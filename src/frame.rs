//! 帧状态
//!
//! 记录当前飞行帧下标、总帧计数以及每个飞行帧的提交计数。
//! 帧下标在 `advance` 时按飞行帧数取模递增；总帧计数单调递增，
//! 用于暂存资源的年龄比较。

use std::sync::atomic::{AtomicU32, Ordering};

use crate::gpu_fatal;

pub struct FrameState {
    frames_in_flight: usize,
    frame_index: usize,
    total_frames: u64,
    submissions: Vec<AtomicU32>,
    max_submissions: u32,
}

impl FrameState {
    /// # 参数
    ///
    /// * `frames_in_flight` - 飞行帧数（至少为 1）
    /// * `max_submissions` - 每帧允许的最大提交次数
    pub fn new(frames_in_flight: usize, max_submissions: u32) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            frames_in_flight,
            frame_index: 0,
            total_frames: 0,
            submissions: (0..frames_in_flight).map(|_| AtomicU32::new(0)).collect(),
            max_submissions,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// 当前飞行帧下标
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// 清零当前飞行帧的提交计数
    pub fn reset_submissions(&self) {
        self.submissions[self.frame_index].store(0, Ordering::Relaxed);
    }

    /// 登记一次提交，返回本帧中的序号
    ///
    /// 超过每帧提交上限是配置错误，直接终止。
    pub fn begin_submission(&self) -> u32 {
        let count = self.submissions[self.frame_index].fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.max_submissions {
            gpu_fatal!(
                "Exceeded max submissions per frame ({}) in frame slot {}",
                self.max_submissions,
                self.frame_index
            );
        }
        count
    }

    pub fn submissions(&self) -> u32 {
        self.submissions[self.frame_index].load(Ordering::Relaxed)
    }

    /// 结束当前帧
    pub fn advance(&mut self) {
        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        self.total_frames += 1;
    }

    /// 在 `created_at` 帧创建的暂存资源是否已经可以回收
    ///
    /// 资源至少要经过 `frames_in_flight + 1` 帧才会被回收。
    pub fn is_expired(&self, created_at: u64) -> bool {
        self.total_frames.saturating_sub(created_at) > self.frames_in_flight as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_wraps() {
        let mut frame = FrameState::new(3, 8);
        let indices: Vec<usize> = (0..7)
            .map(|_| {
                let index = frame.frame_index();
                frame.advance();
                index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(frame.total_frames(), 7);
    }

    #[test]
    fn test_submission_counter_is_per_slot() {
        let mut frame = FrameState::new(2, 4);
        frame.begin_submission();
        frame.begin_submission();
        assert_eq!(frame.submissions(), 2);

        frame.advance();
        assert_eq!(frame.submissions(), 0);
        frame.advance();
        assert_eq!(frame.submissions(), 2);
        frame.reset_submissions();
        assert_eq!(frame.submissions(), 0);
    }

    #[test]
    #[should_panic(expected = "Exceeded max submissions per frame")]
    fn test_submission_ceiling_is_fatal() {
        let frame = FrameState::new(2, 2);
        frame.begin_submission();
        frame.begin_submission();
        frame.begin_submission();
    }

    #[test]
    fn test_expiry_age() {
        let mut frame = FrameState::new(2, 4);
        for _ in 0..3 {
            frame.advance();
        }
        // total_frames == 3，飞行帧数 2：只有第 0 帧的资源过期
        assert!(frame.is_expired(0));
        assert!(!frame.is_expired(1));
        assert!(!frame.is_expired(3));
    }
}

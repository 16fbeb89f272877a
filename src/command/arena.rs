//! 命令流的辅助内存区
//!
//! 容量在创建时固定，只能顺序分配、整体回卷。分配结果是 `AuxSlice<T>`
//! （偏移 + 长度），不是指针；读取时由 arena 做边界与对齐检查后给出类型化视图。

use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;

use crate::gpu_fatal;

const WORD: usize = std::mem::size_of::<u64>();

/// 辅助内存中的一段类型化数据
pub struct AuxSlice<T> {
    offset: u32,
    len: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AuxSlice<T> {
    pub const EMPTY: Self = Self { offset: 0, len: 0, _marker: PhantomData };

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for AuxSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AuxSlice<T> {}

impl<T> PartialEq for AuxSlice<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.len == other.len
    }
}

impl<T> fmt::Debug for AuxSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuxSlice<{}>[{}; +{}]", std::any::type_name::<T>(), self.len, self.offset)
    }
}

/// 固定容量的线性分配器
///
/// 底层以 `u64` 为单位存储，保证每次分配的起点 8 字节对齐。
pub struct AuxArena {
    words: Vec<u64>,
    cursor: usize,
}

impl AuxArena {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            words: vec![0; capacity_bytes.div_ceil(WORD)],
            cursor: 0,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * WORD
    }

    pub fn used_bytes(&self) -> usize {
        self.cursor * WORD
    }

    /// 复制 `data` 到辅助内存
    ///
    /// 超出容量为致命错误：命令流不会扩容。
    pub fn alloc_slice<T: Pod>(&mut self, data: &[T]) -> AuxSlice<T> {
        debug_assert!(std::mem::align_of::<T>() <= WORD);

        if data.is_empty() {
            return AuxSlice::EMPTY;
        }

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let words_needed = bytes.len().div_ceil(WORD);
        if self.cursor + words_needed > self.words.len() {
            gpu_fatal!(
                "Command stream aux memory exhausted: requested {} bytes, {} of {} in use",
                bytes.len(),
                self.used_bytes(),
                self.capacity_bytes()
            );
        }

        let start = self.cursor;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut self.words[start..start + words_needed]);
        dst[..bytes.len()].copy_from_slice(bytes);
        self.cursor += words_needed;

        AuxSlice {
            offset: (start * WORD) as u32,
            len: data.len() as u32,
            _marker: PhantomData,
        }
    }

    /// 读取之前分配的数据
    pub fn get<T: Pod>(&self, slice: AuxSlice<T>) -> &[T] {
        if slice.is_empty() {
            return &[];
        }
        let start = slice.offset as usize;
        let end = start + slice.len() * std::mem::size_of::<T>();
        let bytes: &[u8] = bytemuck::cast_slice(&self.words[..self.cursor]);
        bytemuck::cast_slice(&bytes[start..end])
    }

    /// 回卷到起点，不释放内存
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_read_back() {
        let mut arena = AuxArena::new(64);
        let a = arena.alloc_slice(&[1u8, 2, 3]);
        let b = arena.alloc_slice(&[10u64, 20]);

        assert_eq!(arena.get(a), &[1, 2, 3]);
        assert_eq!(arena.get(b), &[10, 20]);
        assert_eq!(arena.used_bytes(), 24);
    }

    #[test]
    fn test_reset_rewinds() {
        let mut arena = AuxArena::new(16);
        arena.alloc_slice(&[1u32, 2, 3, 4]);
        arena.reset();
        assert_eq!(arena.used_bytes(), 0);
        let s = arena.alloc_slice(&[9u32]);
        assert_eq!(arena.get(s), &[9]);
    }

    #[test]
    fn test_empty_slice() {
        let mut arena = AuxArena::new(0);
        let s = arena.alloc_slice::<u32>(&[]);
        assert!(s.is_empty());
        assert!(arena.get(s).is_empty());
    }

    #[test]
    #[should_panic(expected = "aux memory exhausted")]
    fn test_overflow_is_fatal() {
        let mut arena = AuxArena::new(8);
        arena.alloc_slice(&[0u8; 9]);
    }
}

use std::marker::PhantomData;

use super::Handle;
use crate::gpu_fatal;

/// 基于槽位的对象池
///
/// 句柄即槽位下标。删除只把槽位置空并压入空闲列表，不做压缩，
/// 因此其余存活句柄的下标保持稳定；下一次 `add` 优先复用最近释放的槽位。
///
/// 表的扩容可能移动内部存储，所以外部只能持有句柄，不能长期持有引用。
pub struct HandleTable<H: Handle, T> {
    slots: Vec<Option<T>>,
    free_list: Vec<usize>,
    live: usize,
    _marker: PhantomData<H>,
}

impl<H: Handle, T> HandleTable<H, T> {
    /// 创建句柄表
    ///
    /// # 参数
    ///
    /// * `capacity_hint` - 预分配的槽位数
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity_hint.min(H::CAPACITY)),
            free_list: Vec::new(),
            live: 0,
            _marker: PhantomData,
        }
    }

    /// 插入对象，返回新的或复用的句柄
    ///
    /// 槽位耗尽属于配置错误，直接终止。
    pub fn add(&mut self, item: T) -> H {
        let index = match self.free_list.pop() {
            Some(index) => {
                debug_assert!(self.slots[index].is_none());
                self.slots[index] = Some(item);
                index
            }
            None => {
                if self.slots.len() >= H::CAPACITY {
                    gpu_fatal!(
                        "{} table exhausted: all {} handles are live",
                        H::KIND,
                        H::CAPACITY
                    );
                }
                self.slots.push(Some(item));
                self.slots.len() - 1
            }
        };

        self.live += 1;
        H::from_index(index)
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        if !handle.is_valid() {
            return None;
        }
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        if !handle.is_valid() {
            return None;
        }
        self.slots.get_mut(handle.index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// 删除对象并回收槽位
    ///
    /// 对已删除或无效句柄返回 `None`，不修改表。
    pub fn remove(&mut self, handle: H) -> Option<T> {
        if !handle.is_valid() {
            return None;
        }
        let item = self.slots.get_mut(handle.index())?.take()?;
        self.free_list.push(handle.index());
        self.live -= 1;
        Some(item)
    }

    /// 曾经分配过的最高槽位 + 1
    ///
    /// `0..next_free_id()` 覆盖所有可能存活的句柄，用于关闭时的泄漏检查。
    pub fn next_free_id(&self) -> usize {
        self.slots.len()
    }

    /// 当前存活的对象数
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|item| (H::from_index(i), item)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (H, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|item| (H::from_index(i), item)))
    }

    /// 取出所有存活对象，表恢复为空
    pub fn drain(&mut self) -> Vec<(H, T)> {
        let drained = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.take().map(|item| (H::from_index(i), item)))
            .collect();
        self.slots.clear();
        self.free_list.clear();
        self.live = 0;
        drained
    }
}

impl<H: Handle, T> Default for HandleTable<H, T> {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{BufferHandle, QueueHandle, TextureHandle};
    use std::collections::HashSet;

    #[test]
    fn test_add_remove_reuses_slot() {
        let mut table: HandleTable<TextureHandle, &str> = HandleTable::new(4);
        let a = table.add("a");
        let b = table.add("b");
        let c = table.add("c");
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        assert_eq!(table.remove(b), Some("b"));
        let d = table.add("d");
        assert_eq!(d.index(), 1);
        assert_eq!(table.next_free_id(), 3);
        assert_eq!(table.get(d), Some(&"d"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_removed_handle_is_rejected() {
        let mut table: HandleTable<BufferHandle, u32> = HandleTable::default();
        let h = table.add(7);
        assert_eq!(table.remove(h), Some(7));
        assert!(table.get(h).is_none());
        assert!(table.remove(h).is_none());
        assert!(table.get(BufferHandle::INVALID).is_none());
        assert!(table.get(BufferHandle::from_raw(42)).is_none());
    }

    #[test]
    fn test_live_handles_never_alias() {
        let mut table: HandleTable<BufferHandle, u64> = HandleTable::new(0);
        let mut live: Vec<BufferHandle> = Vec::new();
        let mut seed = 0x2545_f491_u64;

        for step in 0..2000u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if live.is_empty() || seed % 3 != 0 {
                live.push(table.add(step));
            } else {
                let victim = live.swap_remove((seed as usize / 3) % live.len());
                assert!(table.remove(victim).is_some());
            }

            let unique: HashSet<usize> = live.iter().map(|h| h.index()).collect();
            assert_eq!(unique.len(), live.len());
            assert_eq!(table.len(), live.len());
        }
    }

    #[test]
    fn test_iter_and_drain() {
        let mut table: HandleTable<QueueHandle, char> = HandleTable::new(2);
        let a = table.add('a');
        let b = table.add('b');
        table.remove(a);

        let items: Vec<_> = table.iter().collect();
        assert_eq!(items, vec![(b, &'b')]);

        let drained = table.drain();
        assert_eq!(drained, vec![(b, 'b')]);
        assert!(table.is_empty());
        assert_eq!(table.next_free_id(), 0);
    }

    #[test]
    #[should_panic(expected = "queue table exhausted")]
    fn test_exhaustion_is_fatal() {
        let mut table: HandleTable<QueueHandle, ()> = HandleTable::new(0);
        for _ in 0..=QueueHandle::CAPACITY {
            table.add(());
        }
    }
}

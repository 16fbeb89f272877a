//! 强类型句柄与句柄表
//!
//! 每类对象使用独立的句柄类型，位宽按对象数量上限区分：
//! 队列与交换链 8 位，着色器、描述符集、管线相关对象 16 位，
//! 纹理、缓冲区、命令流 32 位。句柄是 `Copy` 的小整数，
//! 不同类别之间无法混用（编译期区分）。
//!
//! 每个句柄类型的最大值保留为 `INVALID` 哨兵。

mod table;

pub use table::HandleTable;

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// 所有句柄类型实现的公共接口
pub trait Handle: Copy + Eq + fmt::Debug {
    /// 句柄类别名称（用于日志）
    const KIND: &'static str;

    /// 可分配的槽位上限（不含 `INVALID` 哨兵）
    const CAPACITY: usize;

    fn from_index(index: usize) -> Self;

    fn index(self) -> usize;

    fn is_valid(self) -> bool;
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $raw:ty, $kind:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
        pub struct $name($raw);

        impl $name {
            /// 无效句柄哨兵
            pub const INVALID: Self = Self(<$raw>::MAX);

            pub const fn raw(self) -> $raw {
                self.0
            }

            pub const fn from_raw(raw: $raw) -> Self {
                Self(raw)
            }
        }

        impl Handle for $name {
            const KIND: &'static str = $kind;
            const CAPACITY: usize = <$raw>::MAX as usize;

            fn from_index(index: usize) -> Self {
                debug_assert!(index < Self::CAPACITY);
                Self(index as $raw)
            }

            fn index(self) -> usize {
                self.0 as usize
            }

            fn is_valid(self) -> bool {
                self.0 != <$raw>::MAX
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if Handle::is_valid(*self) {
                    write!(f, "{}({})", stringify!($name), self.0)
                } else {
                    write!(f, "{}(INVALID)", stringify!($name))
                }
            }
        }
    };
}

define_handle!(
    /// GPU 队列句柄
    QueueHandle, u8, "queue"
);
define_handle!(
    /// 交换链句柄
    SwapchainHandle, u8, "swapchain"
);
define_handle!(
    /// 着色器句柄
    ShaderHandle, u16, "shader"
);
define_handle!(
    /// 描述符集句柄
    DescriptorSetHandle, u16, "descriptor set"
);
define_handle!(
    /// 管线布局句柄
    PipelineLayoutHandle, u16, "pipeline layout"
);
define_handle!(
    /// 图形 / 计算管线句柄
    PipelineHandle, u16, "pipeline"
);
define_handle!(
    /// 采样器句柄
    SamplerHandle, u16, "sampler"
);
define_handle!(
    /// 用户可见的时间线信号量句柄
    SemaphoreHandle, u16, "semaphore"
);
define_handle!(
    /// 纹理句柄（包括交换链代理纹理）
    TextureHandle, u32, "texture"
);
define_handle!(
    /// 缓冲区句柄
    BufferHandle, u32, "buffer"
);
define_handle!(
    /// 命令流句柄
    CommandStreamHandle, u32, "command stream"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_widths() {
        assert_eq!(std::mem::size_of::<QueueHandle>(), 1);
        assert_eq!(std::mem::size_of::<ShaderHandle>(), 2);
        assert_eq!(std::mem::size_of::<TextureHandle>(), 4);
        assert_eq!(QueueHandle::CAPACITY, 255);
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!BufferHandle::INVALID.is_valid());
        assert!(!BufferHandle::default().is_valid());
        assert!(BufferHandle::from_index(0).is_valid());
        assert_eq!(format!("{:?}", TextureHandle::INVALID), "TextureHandle(INVALID)");
        assert_eq!(format!("{:?}", TextureHandle::from_index(7)), "TextureHandle(7)");
    }
}

//! 命令流模块
//!
//! - `arena`：定长辅助内存，存放命令的变长负载
//! - `types`：命令使用的定长记录（拷贝区域、屏障、附件等）
//! - `stream`：命令枚举与命令流
//! - `dispatch`：后端编码器接口，以及按录制顺序回放命令流的 `replay`

pub mod arena;
pub mod dispatch;
pub mod stream;
pub mod types;

pub use arena::{AuxArena, AuxSlice};
pub use dispatch::{replay, CommandEncoder};
pub use stream::{Command, CommandKind, CommandStream, CommandStreamDesc, PushConstantData};
pub use types::*;

//! DistRHI - 多后端图形抽象层
//!
//! 在 Vulkan、DirectX 12 和 Metal 之上提供统一的显式图形接口：
//! 句柄化资源、预录制的命令流、多队列提交与时间线同步、按飞行帧节流的帧生命周期。
//! 另有一个始终编译的模拟后端，用于无 GPU 环境和测试。
//!
//! # 模块结构
//!
//! - `core`: 配置、日志、错误类型
//! - `handle`: 强类型句柄与句柄表
//! - `command`: 命令流、辅助内存与命令分发
//! - `queue`: 队列类型、队列族选择与提交描述
//! - `frame`: 飞行帧状态
//! - `resource` / `shader` / `swapchain`: 资源、着色器与交换链描述
//! - `backend`: 后端接口与各图形 API 的实现
//! - `device`: 与后端无关的设备逻辑
//! - `gpu`: 运行期后端选择
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_rhi::command::CommandStreamDesc;
//! use dist_rhi::core::Config;
//! use dist_rhi::queue::{QueueType, SubmitDesc};
//! use dist_rhi::Gpu;
//!
//! let config = Config::default();
//! let gpu = Gpu::new(&config).unwrap();
//! let mut stream = gpu.create_command_stream(&CommandStreamDesc::new(QueueType::Graphics)).unwrap();
//!
//! gpu.start_frame().unwrap();
//! stream.reset();
//! stream.dispatch(1, 1, 1);
//! gpu.close_command_streams(&[&stream]).unwrap();
//! gpu.submit(&SubmitDesc::new(gpu.primary_queue(QueueType::Graphics), &[stream.handle()])).unwrap();
//! gpu.end_frame();
//! ```

pub mod backend;
pub mod command;
pub mod core;
pub mod device;
pub mod frame;
pub mod gpu;
pub mod handle;
pub mod queue;
pub mod resource;
pub mod shader;
pub mod swapchain;

pub use crate::core::{Config, DistRhiError, Result};
pub use device::Device;
pub use gpu::Gpu;

//! 核心功能模块
//!
//! 与具体图形 API 无关的基础设施：配置、日志和错误类型。
//!
//! - `config`：配置管理，支持从 TOML 文件加载并由命令行覆盖
//! - `log`：日志系统，基于 `tracing`
//! - `error`：统一的错误类型

pub mod config;
pub mod error;
pub mod log;
pub(crate) mod sync;

pub use config::Config;
pub use error::{DistRhiError, Result};

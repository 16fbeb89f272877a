//! 配置管理模块
//!
//! 提供图形抽象层配置的加载、解析和校验。
//! 配置在创建设备时以只读引用的形式传入，之后在设备生命周期内保持不变，
//! 不存在进程级的全局配置对象。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [graphics]
//! backend = "vulkan"              # vulkan, dx12, metal 或 null
//! frames_in_flight = 2
//! max_submissions_per_frame = 32
//! multithreaded_submission = false
//! thread_safe_resources = false
//! sync_timeout_ms = 5000
//! max_extra_graphics_queues = 2
//! validation = false
//! vsync = true
//!
//! [command_stream]
//! command_capacity = 4096
//! aux_memory_bytes = 262144
//! constant_block_bytes = 65536
//!
//! [null_device]
//! completion = "immediate"        # immediate 或 lazy
//!
//! [logging]
//! level = "info"                  # trace, debug, info, warn, error
//! file_output = false
//! log_file = "dist_rhi.log"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::{ConfigError, Result};

/// 允许的最大飞行帧数
pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

/// 图形抽象层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 图形配置
    #[serde(default)]
    pub graphics: GraphicsConfig,

    /// 命令流默认容量
    #[serde(default)]
    pub command_stream: CommandStreamConfig,

    /// 模拟设备（null 后端）配置
    #[serde(default)]
    pub null_device: NullDeviceConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 图形配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// 图形后端选择
    #[serde(default = "default_backend")]
    pub backend: GraphicsBackend,

    /// 飞行帧数（CPU 最多领先 GPU 的帧数）
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,

    /// 每帧最大提交次数，超出视为配置错误
    #[serde(default = "default_max_submissions")]
    pub max_submissions_per_frame: u32,

    /// 多线程提交：为每个原生队列启用自旋锁
    #[serde(default)]
    pub multithreaded_submission: bool,

    /// 资源创建/销毁使用粗粒度锁串行化
    #[serde(default)]
    pub thread_safe_resources: bool,

    /// 同步等待与交换链获取的超时时间（毫秒）
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// 初始化时额外申请的图形队列数
    #[serde(default = "default_extra_graphics_queues")]
    pub max_extra_graphics_queues: u32,

    /// 启用原生验证层 / 调试工具
    #[serde(default)]
    pub validation: bool,

    /// 垂直同步
    #[serde(default = "default_vsync")]
    pub vsync: bool,
}

/// 命令流默认容量
///
/// 创建命令流时若描述中的容量提示为 0，则使用这里的值。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStreamConfig {
    /// 命令条数上限
    #[serde(default = "default_command_capacity")]
    pub command_capacity: u32,

    /// 辅助内存（变长负载）字节数
    #[serde(default = "default_aux_memory")]
    pub aux_memory_bytes: u32,

    /// 常量块字节数（用于模拟 push constant 的后端）
    #[serde(default = "default_constant_block")]
    pub constant_block_bytes: u32,
}

/// 模拟设备的 GPU 完成模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullCompletion {
    /// 提交后立即完成
    Immediate,
    /// 只在 CPU 等待时才推进到被等待的值
    Lazy,
}

/// 模拟设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NullDeviceConfig {
    #[serde(default = "default_null_completion")]
    pub completion: NullCompletion,
}

/// 图形后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    /// Vulkan 后端
    Vulkan,
    /// DirectX 12 后端
    Dx12,
    /// Metal 后端
    Metal,
    /// 无 GPU 的模拟后端
    Null,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_backend() -> GraphicsBackend { GraphicsBackend::Vulkan }
fn default_frames_in_flight() -> u32 { 2 }
fn default_max_submissions() -> u32 { 32 }
fn default_sync_timeout() -> u64 { 5000 }
fn default_extra_graphics_queues() -> u32 { 2 }
fn default_vsync() -> bool { true }
fn default_command_capacity() -> u32 { 4096 }
fn default_aux_memory() -> u32 { 256 * 1024 }
fn default_constant_block() -> u32 { 64 * 1024 }
fn default_null_completion() -> NullCompletion { NullCompletion::Immediate }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_file() -> String { "dist_rhi.log".to_string() }

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            frames_in_flight: default_frames_in_flight(),
            max_submissions_per_frame: default_max_submissions(),
            multithreaded_submission: false,
            thread_safe_resources: false,
            sync_timeout_ms: default_sync_timeout(),
            max_extra_graphics_queues: default_extra_graphics_queues(),
            validation: false,
            vsync: default_vsync(),
        }
    }
}

impl Default for CommandStreamConfig {
    fn default() -> Self {
        Self {
            command_capacity: default_command_capacity(),
            aux_memory_bytes: default_aux_memory(),
            constant_block_bytes: default_constant_block(),
        }
    }
}

impl Default for NullDeviceConfig {
    fn default() -> Self {
        Self { completion: default_null_completion() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 参数
    ///
    /// * `path` - 配置文件路径
    ///
    /// # 返回值
    ///
    /// 成功返回 `Config` 实例，失败返回错误
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use dist_rhi::core::Config;
    ///
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml(&contents)
    }

    /// 从 TOML 文本解析
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// # 说明
    ///
    /// 支持的参数：
    /// - `--vulkan` / `--dx12` / `--metal` / `--null`: 选择后端
    /// - `--frames-in-flight <value>`: 设置飞行帧数
    /// - `--validation`: 启用验证层
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        for arg in &args {
            match arg.as_str() {
                "--vulkan" => self.graphics.backend = GraphicsBackend::Vulkan,
                "--dx12" => self.graphics.backend = GraphicsBackend::Dx12,
                "--metal" => self.graphics.backend = GraphicsBackend::Metal,
                "--null" => self.graphics.backend = GraphicsBackend::Null,
                "--validation" => self.graphics.validation = true,
                _ => {}
            }
        }

        if let Some(idx) = args.iter().position(|a| a == "--frames-in-flight") {
            if let Some(value) = args.get(idx + 1).and_then(|s| s.parse().ok()) {
                self.graphics.frames_in_flight = value;
            }
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let g = &self.graphics;

        if g.frames_in_flight == 0 || g.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::InvalidValue {
                field: "graphics.frames_in_flight".to_string(),
                reason: format!("must be between 1 and {}", MAX_FRAMES_IN_FLIGHT),
            }
            .into());
        }

        if g.max_submissions_per_frame == 0 {
            return Err(ConfigError::InvalidValue {
                field: "graphics.max_submissions_per_frame".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if g.sync_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "graphics.sync_timeout_ms".to_string(),
                reason: "a zero timeout would make every frame wait fail".to_string(),
            }
            .into());
        }

        if self.command_stream.command_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "command_stream.command_capacity".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// 同步等待超时
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.graphics.sync_timeout_ms)
    }

    /// 飞行帧数
    pub fn frames_in_flight(&self) -> usize {
        self.graphics.frames_in_flight as usize
    }
}

impl GraphicsBackend {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            GraphicsBackend::Vulkan => "Vulkan",
            GraphicsBackend::Dx12 => "DirectX 12",
            GraphicsBackend::Metal => "Metal",
            GraphicsBackend::Null => "Null",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.graphics.backend, GraphicsBackend::Vulkan);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.sync_timeout_ms, 5000);
        assert!(!config.graphics.multithreaded_submission);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.graphics.frames_in_flight = 0;
        assert!(config.validate().is_err());

        config.graphics.frames_in_flight = MAX_FRAMES_IN_FLIGHT + 1;
        assert!(config.validate().is_err());

        config.graphics.frames_in_flight = 3;
        config.graphics.max_submissions_per_frame = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            backend = "null"
            frames_in_flight = 3

            [null_device]
            completion = "lazy"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.backend, GraphicsBackend::Null);
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.max_submissions_per_frame, 32);
        assert_eq!(config.null_device.completion, NullCompletion::Lazy);
        assert_eq!(config.command_stream.command_capacity, 4096);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["app", "--null", "--frames-in-flight", "3", "--validation"]);

        assert_eq!(config.graphics.backend, GraphicsBackend::Null);
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert!(config.graphics.validation);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.graphics.backend = GraphicsBackend::Metal;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.graphics.backend, GraphicsBackend::Metal);
    }
}

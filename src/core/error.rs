//! 错误处理模块
//!
//! 定义了图形抽象层使用的统一错误类型。
//!
//! # 错误分类
//!
//! - 可恢复错误：通过 `Result` 返回，并同时写入日志（如描述符更新校验失败、交换链过期）
//! - 配置期错误：初始化时检测（如请求了未编译的后端），返回 `Initialization`
//! - 致命错误：不通过 `Result` 传播，而是经由 `gpu_fatal!` 记录日志后终止
//!   （同步超时、超过单帧提交上限、命令流容量溢出等）

use std::fmt;

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, DistRhiError>;

/// 图形抽象层的错误类型
#[derive(Debug)]
pub enum DistRhiError {
    /// 配置错误
    Config(ConfigError),

    /// 图形 API 错误
    Graphics(GraphicsError),

    /// 描述符集更新校验失败
    Descriptor(DescriptorUpdateError),

    /// IO 错误
    Io(std::io::Error),

    /// 初始化错误
    Initialization(String),

    /// 运行时错误
    Runtime(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug)]
pub enum GraphicsError {
    /// 设备创建失败
    DeviceCreation(String),

    /// 交换链已过期，需要客户端重建
    SwapchainOutOfDate(String),

    /// 交换链次优，需要客户端重建
    SwapchainSuboptimal(String),

    /// 其他交换链错误
    SwapchainError(String),

    /// 着色器编译失败
    ShaderCompilation(String),

    /// 资源创建失败
    ResourceCreation(String),

    /// 命令执行失败
    CommandExecution(String),

    /// 句柄无效（已销毁或从未创建）
    InvalidHandle(String),
}

/// 描述符更新校验错误
///
/// 校验失败时不会发起任何原生 API 调用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorUpdateError {
    /// 描述符集句柄无效
    InvalidSet,

    /// 绑定点不在布局声明中
    BindingOutOfRange { binding: u32 },

    /// 更新数量超出声明的描述符数量
    CountExceeded { binding: u32, requested: u32, declared: u32 },

    /// 更新调用的种类与声明的描述符类型不匹配
    TypeMismatch { binding: u32, declared: &'static str, update: &'static str },

    /// 更新引用的资源句柄无效
    InvalidResource { binding: u32 },
}

impl fmt::Display for DistRhiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistRhiError::Config(e) => write!(f, "Configuration error: {}", e),
            DistRhiError::Graphics(e) => write!(f, "Graphics error: {}", e),
            DistRhiError::Descriptor(e) => write!(f, "Descriptor update rejected: {}", e),
            DistRhiError::Io(e) => write!(f, "IO error: {}", e),
            DistRhiError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            DistRhiError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::DeviceCreation(msg) => write!(f, "Device creation failed: {}", msg),
            GraphicsError::SwapchainOutOfDate(msg) => write!(f, "Swapchain out of date: {}", msg),
            GraphicsError::SwapchainSuboptimal(msg) => write!(f, "Swapchain suboptimal: {}", msg),
            GraphicsError::SwapchainError(msg) => write!(f, "Swapchain error: {}", msg),
            GraphicsError::ShaderCompilation(msg) => write!(f, "Shader compilation failed: {}", msg),
            GraphicsError::ResourceCreation(msg) => write!(f, "Resource creation failed: {}", msg),
            GraphicsError::CommandExecution(msg) => write!(f, "Command execution failed: {}", msg),
            GraphicsError::InvalidHandle(msg) => write!(f, "Invalid handle: {}", msg),
        }
    }
}

impl fmt::Display for DescriptorUpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorUpdateError::InvalidSet => write!(f, "descriptor set handle is invalid"),
            DescriptorUpdateError::BindingOutOfRange { binding } => {
                write!(f, "binding {} is not declared in the set layout", binding)
            }
            DescriptorUpdateError::CountExceeded { binding, requested, declared } => write!(
                f,
                "binding {} declares {} descriptors but the update touches {}",
                binding, declared, requested
            ),
            DescriptorUpdateError::TypeMismatch { binding, declared, update } => write!(
                f,
                "binding {} is declared as {} and cannot take a {} update",
                binding, declared, update
            ),
            DescriptorUpdateError::InvalidResource { binding } => {
                write!(f, "update for binding {} references an invalid resource", binding)
            }
        }
    }
}

impl std::error::Error for DistRhiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DistRhiError::Io(e) => Some(e),
            DistRhiError::Config(e) => Some(e),
            DistRhiError::Graphics(e) => Some(e),
            DistRhiError::Descriptor(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for GraphicsError {}
impl std::error::Error for DescriptorUpdateError {}

// 实现 From trait 以便于错误转换
impl From<std::io::Error> for DistRhiError {
    fn from(err: std::io::Error) -> Self {
        DistRhiError::Io(err)
    }
}

impl From<ConfigError> for DistRhiError {
    fn from(err: ConfigError) -> Self {
        DistRhiError::Config(err)
    }
}

impl From<GraphicsError> for DistRhiError {
    fn from(err: GraphicsError) -> Self {
        DistRhiError::Graphics(err)
    }
}

impl From<DescriptorUpdateError> for DistRhiError {
    fn from(err: DescriptorUpdateError) -> Self {
        DistRhiError::Descriptor(err)
    }
}

impl DistRhiError {
    /// 是否为交换链需要重建的错误
    pub fn is_swapchain_out_of_date(&self) -> bool {
        matches!(
            self,
            DistRhiError::Graphics(GraphicsError::SwapchainOutOfDate(_))
                | DistRhiError::Graphics(GraphicsError::SwapchainSuboptimal(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_error_display() {
        let err: DistRhiError = DescriptorUpdateError::CountExceeded {
            binding: 2,
            requested: 4,
            declared: 1,
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("binding 2"));
        assert!(msg.contains("touches 4"));
    }

    #[test]
    fn test_swapchain_out_of_date_detection() {
        let err: DistRhiError = GraphicsError::SwapchainOutOfDate("window resized".into()).into();
        assert!(err.is_swapchain_out_of_date());

        let err: DistRhiError = GraphicsError::ResourceCreation("oom".into()).into();
        assert!(!err.is_swapchain_out_of_date());
    }
}

use thiserror::Error;

/// SDK 统一错误类型
///
/// 所有变体只携带可克隆的数据，合并中的 catch-up 请求（共享 future）需要把同一个结果
/// 交给多个等待者。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TandemSDKError {
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    /// 实例已销毁，之后的操作一律拒绝
    #[error("Destroyed: {0}")]
    Destroyed(String),
    /// 服务端明确拒绝了命令（终态失败，不重试）
    #[error("Rejected [{code}]: {message}")]
    Rejected { code: u32, message: String },
    #[error("Unknown mutator: {0}")]
    UnknownMutator(String),
}

impl From<serde_json::Error> for TandemSDKError {
    fn from(error: serde_json::Error) -> Self {
        TandemSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for TandemSDKError {
    fn from(error: std::io::Error) -> Self {
        TandemSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for TandemSDKError {
    fn from(error: sled::Error) -> Self {
        TandemSDKError::KvStore(error.to_string())
    }
}

impl TandemSDKError {
    /// 是否属于可自愈的瞬时错误（网络/超时），用于日志分级与重连判断
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TandemSDKError::NotConnected | TandemSDKError::Transport(_) | TandemSDKError::Timeout(_)
        )
    }

    /// 服务端拒绝码（如果这是一个拒绝错误）
    pub fn rejection_code(&self) -> Option<u32> {
        match self {
            TandemSDKError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 从服务端拒绝响应创建错误
    pub fn rejected(code: u32, message: impl Into<String>) -> Self {
        TandemSDKError::Rejected {
            code,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TandemSDKError>;

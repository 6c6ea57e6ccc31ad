use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("网络请求错误: {0}")]
    NetworkError(String),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("YAML配置错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("API错误: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("仓位未找到: {symbol}")]
    PositionNotFound { symbol: String },

    #[error("订单错误: {0}")]
    OrderError(String),

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_ms}毫秒)")]
    TimeoutError { operation: String, timeout_ms: u64 },

    #[error("存储错误: {0}")]
    RepositoryError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("参数验证错误: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("不支持的功能: {0}")]
    NotSupported(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl ExchangeError {
    /// 判断错误是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::NetworkError(_) => true,
            ExchangeError::TimeoutError { .. } => true,
            ExchangeError::RepositoryError(_) => true,
            ExchangeError::ApiError { code, .. } => {
                // HTTP 5xx 错误通常可以重试
                *code >= 500 && *code < 600
            }
            _ => false,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExchangeError::NetworkError(_) => ErrorSeverity::Warning,
            ExchangeError::TimeoutError { .. } => ErrorSeverity::Warning,
            ExchangeError::PositionNotFound { .. } => ErrorSeverity::Info,
            ExchangeError::ValidationError { .. } => ErrorSeverity::Error,
            ExchangeError::ConfigError(_) => ErrorSeverity::Critical,
            ExchangeError::YamlError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        ExchangeError::TimeoutError {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Info,     // 信息性错误，通常不影响操作
    Warning,  // 警告性错误，可能影响性能但可以重试
    Error,    // 一般错误，需要用户处理
    Critical, // 严重错误，需要立即处理
}

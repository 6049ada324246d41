//! 错误类型：构造期配置错误 + 生成调用的封闭错误分类
//!
//! Adapter 与 Router 负责分类并返回带类型的错误；DialogueController 是每轮对话唯一的捕获边界。

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 构造期错误（未知后端 / 缺少凭据）：致命，不重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown AI provider: {0}")]
    UnknownBackend(String),

    #[error("API key not provided for {0}")]
    MissingCredential(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 生成失败的类别（用于日志与调用方决策）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimited,
    QuotaExceeded,
    Transient,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "auth_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Transient => "transient_error",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// 生成调用失败（封闭分类）。Router 不重试，只把类别与消息交给调用方。
#[derive(Error, Debug, Clone)]
pub enum GenerationError {
    /// 凭据错误：直接上报，不重试
    #[error("API authentication failed: {0}")]
    Auth(String),

    /// 限流：附带建议等待时间，核心内不自动重试
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("API quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    /// 网络 / 超时：调用方可重试单轮，核心内无重试循环
    #[error("Transient failure: {0}")]
    Transient(String),

    /// 返回结构异常或无法识别的错误
    #[error("Unexpected backend failure: {0}")]
    Unknown(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::Auth(_) => ErrorKind::Auth,
            GenerationError::RateLimited { .. } => ErrorKind::RateLimited,
            GenerationError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            GenerationError::Transient(_) => ErrorKind::Transient,
            GenerationError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// 限流 / 配额类错误的等待建议
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimited { retry_after, .. }
            | GenerationError::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        GenerationError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        GenerationError::QuotaExceeded {
            message: message.into(),
            retry_after: None,
        }
    }

    /// 按 HTTP 状态码与错误正文归类（各 HTTP 后端共用）
    ///
    /// 配额关键字优先于状态码：部分后端用 429 同时表示限流与配额耗尽。
    pub fn from_http_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let lower = body.to_lowercase();
        if lower.contains("quota") || lower.contains("insufficient_quota") {
            return GenerationError::QuotaExceeded {
                message: body.to_string(),
                retry_after,
            };
        }
        match status {
            401 | 403 => GenerationError::Auth(body.to_string()),
            429 => GenerationError::rate_limited(body, retry_after),
            408 | 500..=599 => GenerationError::Transient(format!("HTTP {}: {}", status, body)),
            _ => GenerationError::Unknown(format!("HTTP {}: {}", status, body)),
        }
    }

    /// reqwest 传输层错误：超时 / 连接失败 → Transient，响应体解析失败 → Unknown
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            GenerationError::Unknown(format!("Malformed response: {}", err))
        } else if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            GenerationError::Transient(err.to_string())
        } else {
            GenerationError::Unknown(err.to_string())
        }
    }
}

/// 解析 retry-after 头（秒数形式）
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

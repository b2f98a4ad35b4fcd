//! 错误处理模块
//! Error handling module
//!
//! 定义了 schedq 库中使用的各种错误类型
//! Defines various error types used in the schedq library

use thiserror::Error;
use uuid::Uuid;

/// schedq 库的结果类型
/// Result type for the schedq library
pub type Result<T> = std::result::Result<T, Error>;

/// schedq 错误类型
/// schedq error type
#[derive(Error, Debug)]
pub enum Error {
  #[cfg(feature = "redis")]
  /// Redis connection error
  #[error("Redis connection error: {0}")]
  Redis(#[from] redis::RedisError),

  #[cfg(feature = "postgres")]
  /// SeaORM 数据库错误
  /// SeaORM database error
  #[error("SeaORM database error: {0}")]
  SeaOrm(#[from] sea_orm::DbErr),

  #[cfg(feature = "postgres")]
  /// 通知监听错误
  /// Notification listener error
  #[error("Notification listener error: {0}")]
  Listener(#[from] sqlx::Error),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// 调度项未找到错误
  /// Schedule item not found error
  #[error("Schedule item not found: {id}")]
  ItemNotFound { id: Uuid },

  /// 无效的调度类别
  /// Invalid schedule kind
  #[error("Invalid schedule kind: {kind}")]
  InvalidKind { kind: String },

  /// 无效的匹配模式
  /// Invalid match pattern
  #[error("Invalid pattern: {pattern}")]
  InvalidPattern { pattern: String },

  /// 类别未注册事件构建器
  /// No event builder registered for the kind
  #[error("No event builder registered for kind: {kind}")]
  NoBuilder { kind: String },

  /// 事件构建失败（数据问题，不可重试）
  /// Event build failure (data problem, not retriable)
  #[error("Event build failed for kind {kind}: {message}")]
  Builder { kind: String, message: String },

  /// 存储错误
  /// Store error
  #[error("Store error: {0}")]
  Store(String),

  /// 事件总线错误
  /// Event bus error
  #[error("Bus error: {0}")]
  Bus(String),

  /// 引擎已关闭
  /// Engine closed
  #[error("Engine closed")]
  EngineClosed,

  /// 引擎已在运行
  /// Engine is already running
  #[error("Engine is already running")]
  EngineRunning,

  /// 超时错误
  /// Timeout error
  #[error("Operation timeout")]
  Timeout,

  /// 取消错误
  /// Cancellation error
  #[error("Operation cancelled")]
  Cancelled,

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建存储错误
  /// Create a store error
  pub fn store<S: Into<String>>(message: S) -> Self {
    Self::Store(message.into())
  }

  /// 创建事件总线错误
  /// Create an event bus error
  pub fn bus<S: Into<String>>(message: S) -> Self {
    Self::Bus(message.into())
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建事件构建错误
  /// Create an event build error
  pub fn builder<K: Into<String>, S: Into<String>>(kind: K, message: S) -> Self {
    Self::Builder {
      kind: kind.into(),
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 检查是否为可重试错误
  /// Check if the error is retriable
  ///
  /// 可重试错误是连接层面的瞬时故障；数据层面的错误不可重试
  /// Retriable errors are transient connection-level failures; data-level errors are not
  pub fn is_retriable(&self) -> bool {
    match self {
      #[cfg(feature = "redis")]
      Error::Redis(_) => return true,
      #[cfg(feature = "postgres")]
      Error::SeaOrm(_) => {}
      #[cfg(feature = "postgres")]
      Error::Listener(_) => return true,
      Error::Serialization(_) => {}
      Error::ItemNotFound { .. } => {}
      Error::InvalidKind { .. } => {}
      Error::InvalidPattern { .. } => {}
      Error::NoBuilder { .. } => {}
      Error::Builder { .. } => {}
      Error::Store(_) => {}
      Error::EngineClosed => {}
      Error::EngineRunning => {}
      Error::Cancelled => {}
      Error::Config { .. } => {}
      Error::Io(_) | Error::Timeout | Error::Bus(_) => {
        return true;
      }
      Error::Other { .. } => {}
    }
    false
  }

  /// 检查是否为致命错误
  /// Check if the error is fatal
  pub fn is_fatal(&self) -> bool {
    !self.is_retriable()
  }
}

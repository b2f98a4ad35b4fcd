//! 配置模块
//! Configuration module
//!
//! 定义各组件的配置选项以及统一的退避策略
//! Defines configuration options for each component and the unified backoff policy

use crate::error::{Error, Result};
use std::time::Duration;

/// 默认的租户作用域，用作路由键的首个点分段
/// Default tenant scope, used as the first dot-segment of routing keys
pub const DEFAULT_SCOPE: &str = "global";

/// 指数退避策略
/// Exponential backoff policy
///
/// `delay_for(n) = min(base * factor^n, cap)`，可选按比例抖动。
/// 发布器重连与重试守护进程共用此类型，各自持有独立实例。
/// `delay_for(n) = min(base * factor^n, cap)`, with optional proportional jitter.
/// Publisher reconnects and the retry daemon share this type with separate instances.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
  /// 基础延迟
  /// Base delay
  pub base: Duration,
  /// 每次尝试的增长系数
  /// Growth factor per attempt
  pub factor: f64,
  /// 延迟上限
  /// Delay cap
  pub cap: Duration,
  /// 最大尝试次数
  /// Maximum number of attempts
  pub max_attempts: u32,
  /// 是否加入 ±25% 抖动
  /// Whether to apply ±25% jitter
  pub jitter: bool,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(1),
      factor: 2.0,
      cap: Duration::from_secs(600),
      max_attempts: 5,
      jitter: false,
    }
  }
}

impl BackoffPolicy {
  /// 创建新的退避策略
  /// Create a new backoff policy
  pub fn new(base: Duration, factor: f64, cap: Duration, max_attempts: u32) -> Self {
    Self {
      base,
      factor,
      cap,
      max_attempts,
      jitter: false,
    }
  }

  /// 重连场景的默认策略：起步快、上限低、带抖动
  /// Default policy for reconnect scenarios: fast start, low cap, jittered
  pub fn reconnect() -> Self {
    Self {
      base: Duration::from_millis(100),
      factor: 2.0,
      cap: Duration::from_secs(10),
      max_attempts: 5,
      jitter: true,
    }
  }

  /// 启用抖动
  /// Enable jitter
  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  /// 计算第 n 次尝试后的延迟（n 从 0 开始）
  /// Compute the delay after attempt n (0-based)
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = self.factor.powi(attempt.min(63) as i32);
    let cap_ms = self.cap.as_millis() as f64;
    let mut millis = (self.base.as_millis() as f64 * exp).min(cap_ms);
    if self.jitter {
      let spread = 0.75 + rand::random::<f64>() * 0.5;
      millis = (millis * spread).min(cap_ms);
    }
    Duration::from_millis(millis as u64)
  }

  /// 是否还有下一次尝试
  /// Whether another attempt remains
  pub fn has_next(&self, attempt: u32) -> bool {
    attempt + 1 < self.max_attempts
  }

  /// 验证策略
  /// Validate the policy
  pub fn validate(&self) -> Result<()> {
    if self.base.is_zero() {
      return Err(Error::config("Backoff base delay must be positive"));
    }
    if self.factor < 1.0 {
      return Err(Error::config("Backoff factor must be at least 1.0"));
    }
    if self.cap < self.base {
      return Err(Error::config("Backoff cap must be at least the base delay"));
    }
    if self.max_attempts == 0 {
      return Err(Error::config("Backoff max_attempts must be at least 1"));
    }
    Ok(())
  }
}

/// 调度守护进程配置
/// Dispatcher daemon configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
  /// 单次认领的最大条数
  /// Maximum number of items per claim
  pub batch_limit: usize,
  /// 兜底轮询间隔：唤醒信号丢失时的最大睡眠时间
  /// Safety-net poll interval: maximum sleep when a wake signal is lost
  pub poll_interval: Duration,
  /// 唤醒订阅断开后的重订阅退避
  /// Resubscribe backoff after the wake subscription drops
  pub resubscribe_backoff: BackoffPolicy,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      batch_limit: 100,
      poll_interval: Duration::from_secs(30),
      resubscribe_backoff: BackoffPolicy::reconnect(),
    }
  }
}

impl DispatcherConfig {
  /// 创建新的调度守护进程配置
  /// Create a new dispatcher configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置认领批量
  /// Set the claim batch limit
  pub fn batch_limit(mut self, limit: usize) -> Self {
    self.batch_limit = limit.max(1);
    self
  }

  /// 设置兜底轮询间隔
  /// Set the safety-net poll interval
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.batch_limit == 0 {
      return Err(Error::config("Dispatcher batch_limit must be at least 1"));
    }
    if self.poll_interval.is_zero() {
      return Err(Error::config("Dispatcher poll_interval must be positive"));
    }
    self.resubscribe_backoff.validate()
  }
}

/// 过期清扫配置
/// Staleness sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
  /// 清扫间隔
  /// Sweep interval
  pub interval: Duration,
  /// 认领超过此时长仍未完结的项会被释放回 PENDING
  /// Claims older than this are released back to PENDING
  pub staleness_after: Duration,
}

impl Default for SweeperConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(60),
      staleness_after: Duration::from_secs(600),
    }
  }
}

impl SweeperConfig {
  /// 创建新的清扫配置
  /// Create a new sweeper configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置清扫间隔
  /// Set the sweep interval
  pub fn interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// 设置过期阈值
  /// Set the staleness threshold
  pub fn staleness_after(mut self, staleness_after: Duration) -> Self {
    self.staleness_after = staleness_after;
    self
  }

  /// 验证配置
  /// Validate the configuration
  ///
  /// 阈值必须大于认领到完结的正常耗时，否则清扫会与活跃的守护进程打架
  /// The threshold must exceed normal claim-to-finish latency, or the sweep
  /// fights with live daemons
  pub fn validate(&self) -> Result<()> {
    if self.interval.is_zero() {
      return Err(Error::config("Sweeper interval must be positive"));
    }
    if self.staleness_after.is_zero() {
      return Err(Error::config("Sweeper staleness_after must be positive"));
    }
    Ok(())
  }
}

/// 重试守护进程配置
/// Retry daemon configuration
#[derive(Debug, Clone)]
pub struct RetrierConfig {
  /// 最大投递尝试次数，超过后写入审计并确认
  /// Maximum delivery attempts before the audit record is written and acked
  pub max_attempts: u32,
  /// 重投延迟策略
  /// Redelivery backoff policy
  pub backoff: BackoffPolicy,
  /// 单次死信读取的阻塞等待时间
  /// Blocking wait per dead letter read
  pub receive_wait: Duration,
}

impl Default for RetrierConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      backoff: BackoffPolicy::default(),
      receive_wait: Duration::from_secs(1),
    }
  }
}

impl RetrierConfig {
  /// 创建新的重试配置
  /// Create a new retrier configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置最大尝试次数
  /// Set the maximum attempts
  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// 设置重投延迟策略
  /// Set the redelivery backoff policy
  pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
    self.backoff = backoff;
    self
  }

  /// 设置死信读取等待
  /// Set the dead letter receive wait
  pub fn receive_wait(mut self, wait: Duration) -> Self {
    self.receive_wait = wait;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.max_attempts == 0 {
      return Err(Error::config("Retrier max_attempts must be at least 1"));
    }
    if self.receive_wait.is_zero() {
      return Err(Error::config("Retrier receive_wait must be positive"));
    }
    self.backoff.validate()
  }
}

/// 发布器配置
/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
  /// 租户作用域，构成路由键首段
  /// Tenant scope, the first segment of routing keys
  pub scope: String,
  /// 单次发布尝试的超时
  /// Timeout per publish attempt
  pub publish_timeout: Duration,
  /// 发布失败后的重连退避
  /// Reconnect backoff after a publish failure
  pub reconnect_backoff: BackoffPolicy,
}

impl Default for PublisherConfig {
  fn default() -> Self {
    Self {
      scope: DEFAULT_SCOPE.to_string(),
      publish_timeout: Duration::from_secs(5),
      reconnect_backoff: BackoffPolicy::reconnect(),
    }
  }
}

impl PublisherConfig {
  /// 创建新的发布器配置
  /// Create a new publisher configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置租户作用域
  /// Set the tenant scope
  pub fn scope<S: Into<String>>(mut self, scope: S) -> Self {
    self.scope = scope.into();
    self
  }

  /// 设置发布超时
  /// Set the publish timeout
  pub fn publish_timeout(mut self, timeout: Duration) -> Self {
    self.publish_timeout = timeout;
    self
  }

  /// 设置重连退避
  /// Set the reconnect backoff
  pub fn reconnect_backoff(mut self, backoff: BackoffPolicy) -> Self {
    self.reconnect_backoff = backoff;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    // 作用域是路由键的一个点分段，不能为空或含 '.'
    // The scope is one dot-segment of the routing key, must be non-empty and dot-free
    let scope_ok = !self.scope.is_empty()
      && self
        .scope
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-');
    if !scope_ok {
      return Err(Error::config(format!("Invalid scope: {}", self.scope)));
    }
    if self.publish_timeout.is_zero() {
      return Err(Error::config("Publisher publish_timeout must be positive"));
    }
    self.reconnect_backoff.validate()
  }
}

/// 引擎配置 - 聚合所有组件配置
/// Engine configuration - aggregates all component configurations
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub dispatcher: DispatcherConfig,
  pub sweeper: SweeperConfig,
  pub retrier: RetrierConfig,
  pub publisher: PublisherConfig,
  /// 每个组件关停等待的上限
  /// Upper bound on the shutdown wait per component
  pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      dispatcher: DispatcherConfig::default(),
      sweeper: SweeperConfig::default(),
      retrier: RetrierConfig::default(),
      publisher: PublisherConfig::default(),
      shutdown_timeout: Duration::from_secs(8),
    }
  }
}

impl EngineConfig {
  /// 创建新的引擎配置
  /// Create a new engine configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置调度守护进程配置
  /// Set the dispatcher configuration
  pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
    self.dispatcher = dispatcher;
    self
  }

  /// 设置清扫配置
  /// Set the sweeper configuration
  pub fn sweeper(mut self, sweeper: SweeperConfig) -> Self {
    self.sweeper = sweeper;
    self
  }

  /// 设置重试配置
  /// Set the retrier configuration
  pub fn retrier(mut self, retrier: RetrierConfig) -> Self {
    self.retrier = retrier;
    self
  }

  /// 设置发布器配置
  /// Set the publisher configuration
  pub fn publisher(mut self, publisher: PublisherConfig) -> Self {
    self.publisher = publisher;
    self
  }

  /// 设置关停超时
  /// Set the shutdown timeout
  pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    self.dispatcher.validate()?;
    self.sweeper.validate()?;
    self.retrier.validate()?;
    self.publisher.validate()?;
    if self.shutdown_timeout.is_zero() {
      return Err(Error::config("Engine shutdown_timeout must be positive"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_growth_and_cap() {
    let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60), 10);

    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    // 超过上限后封顶
    // Capped once past the limit
    assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    assert_eq!(policy.delay_for(63), Duration::from_secs(60));
  }

  #[test]
  fn test_backoff_monotonic_without_jitter() {
    let policy = BackoffPolicy::new(Duration::from_millis(250), 2.0, Duration::from_secs(30), 8);
    let mut last = Duration::ZERO;
    for attempt in 0..8 {
      let delay = policy.delay_for(attempt);
      assert!(delay >= last, "delay decreased at attempt {attempt}");
      assert!(delay <= policy.cap);
      last = delay;
    }
  }

  #[test]
  fn test_backoff_jitter_bounds() {
    let policy =
      BackoffPolicy::new(Duration::from_secs(4), 1.0, Duration::from_secs(60), 3).with_jitter(true);
    for _ in 0..50 {
      let delay = policy.delay_for(0);
      assert!(delay >= Duration::from_secs(3));
      assert!(delay <= Duration::from_secs(5));
    }
  }

  #[test]
  fn test_backoff_attempt_exhaustion() {
    let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60), 3);
    assert!(policy.has_next(0));
    assert!(policy.has_next(1));
    assert!(!policy.has_next(2));
    assert!(!policy.has_next(10));
  }

  #[test]
  fn test_backoff_validation() {
    assert!(BackoffPolicy::default().validate().is_ok());

    let bad = BackoffPolicy::new(Duration::ZERO, 2.0, Duration::from_secs(1), 3);
    assert!(bad.validate().is_err());

    let bad = BackoffPolicy::new(Duration::from_secs(2), 0.5, Duration::from_secs(10), 3);
    assert!(bad.validate().is_err());

    let bad = BackoffPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(1), 3);
    assert!(bad.validate().is_err());
  }

  #[test]
  fn test_dispatcher_config_default() {
    let config = DispatcherConfig::default();
    assert_eq!(config.batch_limit, 100);
    assert_eq!(config.poll_interval, Duration::from_secs(30));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_dispatcher_config_builder() {
    let config = DispatcherConfig::new()
      .batch_limit(0)
      .poll_interval(Duration::from_secs(5));
    // batch_limit 被钳制到至少 1
    // batch_limit is clamped to at least 1
    assert_eq!(config.batch_limit, 1);
    assert_eq!(config.poll_interval, Duration::from_secs(5));
  }

  #[test]
  fn test_sweeper_config_default() {
    let config = SweeperConfig::default();
    assert_eq!(config.interval, Duration::from_secs(60));
    assert_eq!(config.staleness_after, Duration::from_secs(600));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_retrier_config_default() {
    let config = RetrierConfig::default();
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.receive_wait, Duration::from_secs(1));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_publisher_scope_validation() {
    let config = PublisherConfig::default();
    assert_eq!(config.scope, DEFAULT_SCOPE);
    assert!(config.validate().is_ok());

    let config = PublisherConfig::new().scope("tenant-7");
    assert!(config.validate().is_ok());

    let config = PublisherConfig::new().scope("bad.scope");
    assert!(config.validate().is_err());

    let config = PublisherConfig::new().scope("");
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_engine_config_validation() {
    let config = EngineConfig::new();
    assert!(config.validate().is_ok());

    let config = EngineConfig::new().shutdown_timeout(Duration::ZERO);
    assert!(config.validate().is_err());
  }
}

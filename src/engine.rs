//! 引擎模块
//! Engine module
//!
//! 把存储、总线、审计槽和事件构建器装配成一组运行中的后台组件
//! Wires the store, bus, audit sink, and event builders into a set of running
//! background components
//!
//! 每个精确注册的类别得到一个 Dispatcher，外加一个 Sweeper 和一个 Retrier。
//! 通配符模式只参与构建器解析，不会自己产生 Dispatcher。
//! Every exactly registered kind gets its own Dispatcher, plus one Sweeper and
//! one Retrier. Wildcard patterns only participate in builder resolution and
//! do not spawn dispatchers of their own.

use crate::audit::AuditSink;
use crate::builder::{BuilderRegistry, EventBuilder};
use crate::bus::EventBus;
use crate::components::{ComponentLifecycle, Dispatcher, Retrier, Sweeper};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::item::{NewScheduleItem, ScheduleItem};
use crate::message::OutboundMessage;
use crate::publisher::Publisher;
use crate::store::ScheduleStore;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 引擎状态
/// Engine state
#[derive(Debug, Clone, Copy, PartialEq)]
enum EngineState {
  // 新建，尚未启动
  New,
  // 组件运行中
  Running,
  // 已关闭
  Closed,
}

/// Engine - 调度核心的装配与生命周期管理
/// Engine - assembly and lifecycle management for the scheduling core
pub struct Engine {
  store: Arc<dyn ScheduleStore>,
  bus: Arc<dyn EventBus>,
  audit: Arc<dyn AuditSink>,
  config: EngineConfig,
  registry: BuilderRegistry,
  state: EngineState,
  // 统一管理实现了 ComponentLifecycle 的组件
  // Unified management of components implementing ComponentLifecycle
  components: Vec<(Arc<dyn ComponentLifecycle + Send + Sync>, JoinHandle<()>)>,
}

impl Engine {
  /// 创建新的引擎实例
  /// Create a new engine instance
  pub fn new(
    store: Arc<dyn ScheduleStore>,
    bus: Arc<dyn EventBus>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
  ) -> Result<Self> {
    // 验证配置
    // Validate configuration
    config.validate()?;

    Ok(Self {
      store,
      bus,
      audit,
      config,
      registry: BuilderRegistry::new(),
      state: EngineState::New,
      components: Vec::new(),
    })
  }

  /// 注册事件构建器
  /// Register an event builder
  ///
  /// 启动前调用；精确类别会各自获得一个 Dispatcher
  /// Call before starting; each exact kind gets its own Dispatcher
  pub fn register<S: Into<String>>(
    &mut self,
    pattern: S,
    builder: Arc<dyn EventBuilder>,
  ) -> Result<()> {
    self.registry.register(pattern, builder)
  }

  /// 注册闭包构建器
  /// Register a closure builder
  pub fn register_fn<S, F>(&mut self, pattern: S, func: F) -> Result<()>
  where
    S: Into<String>,
    F: Fn(&ScheduleItem) -> Result<OutboundMessage> + Send + Sync + 'static,
  {
    self.registry.register_fn(pattern, func)
  }

  /// 插入一个调度项
  /// Insert a schedule item
  pub async fn schedule(&self, item: NewScheduleItem) -> Result<ScheduleItem> {
    self.store.insert(item).await
  }

  /// 底层存储
  /// The underlying store
  pub fn store(&self) -> Arc<dyn ScheduleStore> {
    Arc::clone(&self.store)
  }

  /// 底层总线
  /// The underlying bus
  pub fn bus(&self) -> Arc<dyn EventBus> {
    Arc::clone(&self.bus)
  }

  /// 审计槽
  /// The audit sink
  pub fn audit(&self) -> Arc<dyn AuditSink> {
    Arc::clone(&self.audit)
  }

  /// 启动所有后台组件
  /// Start all background components
  pub async fn start(&mut self) -> Result<()> {
    match self.state {
      EngineState::New => {}
      EngineState::Running => return Err(Error::EngineRunning),
      EngineState::Closed => return Err(Error::EngineClosed),
    }

    // 启动前确认两端都可达
    // Confirm both ends are reachable before starting
    self.store.ping().await?;
    self.bus.ping().await?;

    self.state = EngineState::Running;

    let kinds = self.registry.exact_kinds();
    if kinds.is_empty() {
      warn!("Engine: no exact kinds registered, running without dispatchers");
    }

    // 每个精确类别一个 Dispatcher，共享同一个发布器
    // One Dispatcher per exact kind, sharing a single publisher
    let publisher = Arc::new(Publisher::new(
      Arc::clone(&self.bus),
      self.config.publisher.clone(),
    )?);
    for kind in &kinds {
      let builder = self.registry.resolve(kind)?;
      let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&self.store),
        Arc::clone(&publisher),
        builder,
        kind.clone(),
        self.config.dispatcher.clone(),
      ));
      let handle = dispatcher.clone().start();
      self.components.push((
        dispatcher as Arc<dyn ComponentLifecycle + Send + Sync>,
        handle,
      ));
    }

    // 启动 Sweeper - 回收过期认领
    // Start Sweeper - reclaim stale claims
    let sweeper = Arc::new(Sweeper::new(
      Arc::clone(&self.store),
      kinds,
      self.config.sweeper.clone(),
    ));
    let sweeper_handle = sweeper.clone().start();
    self.components.push((
      sweeper as Arc<dyn ComponentLifecycle + Send + Sync>,
      sweeper_handle,
    ));

    // 启动 Retrier - 重投死信并记录终态失败
    // Start Retrier - redeliver dead letters and record terminal failures
    let retrier = Arc::new(Retrier::new(
      Arc::clone(&self.bus),
      Arc::clone(&self.audit),
      self.config.retrier.clone(),
    ));
    let retrier_handle = retrier.clone().start();
    self.components.push((
      retrier as Arc<dyn ComponentLifecycle + Send + Sync>,
      retrier_handle,
    ));

    info!(
      "Engine: started {} component(s)",
      self.components.len()
    );
    Ok(())
  }

  /// 运行引擎直到收到停止信号
  /// Run the engine until a stop signal is received
  pub async fn run(&mut self) -> Result<()> {
    self.start().await?;

    // 等待停止信号
    // Wait for stop signal
    self.wait_for_signal().await;

    self.shutdown().await
  }

  /// 关闭引擎
  /// Shutdown the engine
  ///
  /// 组件按启动顺序收到关闭信号；每个句柄的等待以 `shutdown_timeout` 为上限
  /// Components receive the shutdown signal in start order; each handle is
  /// awaited up to `shutdown_timeout`
  pub async fn shutdown(&mut self) -> Result<()> {
    if self.state == EngineState::Closed {
      return Ok(());
    }
    self.state = EngineState::Closed;

    for (component, handle) in self.components.drain(..) {
      component.shutdown();
      if tokio::time::timeout(self.config.shutdown_timeout, handle)
        .await
        .is_err()
      {
        warn!(
          "Engine: component did not stop within {:?}",
          self.config.shutdown_timeout
        );
      }
    }

    // 关闭连接
    // Close connections
    self.bus.close().await?;
    self.store.close().await?;

    info!("Engine: shut down");
    Ok(())
  }

  /// 等待停止信号
  /// Wait for stop signal
  async fn wait_for_signal(&self) {
    let _ = signal::ctrl_c().await;
    info!("Engine: received shutdown signal");
  }
}

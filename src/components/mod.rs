//! 生命周期模块
//! Lifecycle module
//!
//! 提供通用的组件生命周期管理 trait
//! Provides a common trait for component lifecycle management
//!
//! 此模块定义了统一的生命周期接口，用于管理各种后台组件（如 Dispatcher、Sweeper 等）
//! This module defines a unified lifecycle interface for managing various background
//! components (such as Dispatcher, Sweeper, etc.)

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod dispatcher;
pub mod retrier;
pub mod sweeper;

pub use dispatcher::Dispatcher;
pub use retrier::Retrier;
pub use sweeper::Sweeper;

/// ComponentLifecycle trait - 组件生命周期管理接口
/// ComponentLifecycle trait - component lifecycle management interface
///
/// 此 trait 定义了组件的基本生命周期操作：启动、关闭和状态检查
/// This trait defines the basic lifecycle operations for components: start,
/// shutdown, and state check
///
/// # 实现者 / Implementors
///
/// - [`Dispatcher`](dispatcher::Dispatcher) - 按类别认领到期的调度项并发布事件
/// - [`Sweeper`](sweeper::Sweeper) - 释放停留过久的认领，供重新投递
/// - [`Retrier`](retrier::Retrier) - 消费死信并按退避策略重投或写入审计
///
/// # 示例 / Example
///
/// ```rust,no_run
/// use schedq::components::{ComponentLifecycle, Sweeper};
/// use schedq::config::SweeperConfig;
/// use schedq::store::memory::MemoryStore;
/// use schedq::store::ScheduleStore;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store: Arc<dyn ScheduleStore> = Arc::new(MemoryStore::new());
/// let sweeper = Arc::new(Sweeper::new(
///   store,
///   vec!["reminder".to_string()],
///   SweeperConfig::default(),
/// ));
///
/// // 启动组件
/// // Start component
/// let handle = sweeper.clone().start();
///
/// // 检查状态
/// // Check state
/// assert!(!sweeper.is_done());
///
/// // 关闭组件
/// // Shutdown component
/// sweeper.shutdown();
/// assert!(sweeper.is_done());
/// # handle.await?;
/// # Ok(())
/// # }
/// ```
pub trait ComponentLifecycle {
  /// 启动组件
  /// Start the component
  ///
  /// 此方法启动组件的后台任务，返回一个 JoinHandle 用于等待任务完成
  /// This method starts the component's background task, returning a JoinHandle
  /// to wait for completion
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 关闭组件
  /// Shutdown the component
  ///
  /// 此方法发送关闭信号给组件，组件会在完成当前操作后停止
  /// This method sends a shutdown signal to the component, which will stop after
  /// completing current operations
  fn shutdown(&self);

  /// 检查组件是否已完成
  /// Check if the component is done
  fn is_done(&self) -> bool;
}

//! Sweeper 模块
//! Sweeper module
//!
//! 定期释放停留过久的认领，把调度项放回 PENDING 供重新投递
//! Periodically releases claims that have lingered too long, putting items
//! back to PENDING for redelivery
//!
//! 认领者在发布前崩溃时，调度项会停在 CLAIMED 无人问津；
//! 清扫是针对这种情况的恢复路径。
//! When a claimant crashes before publishing, its items sit in CLAIMED with no
//! owner; the sweep is the recovery path for that case.

use crate::config::SweeperConfig;
use crate::error::Result;
use crate::store::ScheduleStore;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::ComponentLifecycle;

/// Sweeper - 负责回收过期的认领
/// Sweeper - responsible for reclaiming stale claims
pub struct Sweeper {
  store: Arc<dyn ScheduleStore>,
  kinds: Vec<String>,
  config: SweeperConfig,
  done: Arc<AtomicBool>,
  nudge: Notify,
}

impl Sweeper {
  /// 创建新的 Sweeper
  /// Create a new Sweeper
  pub fn new(store: Arc<dyn ScheduleStore>, kinds: Vec<String>, config: SweeperConfig) -> Self {
    Self {
      store,
      kinds,
      config,
      done: Arc::new(AtomicBool::new(false)),
      nudge: Notify::new(),
    }
  }

  /// 启动 Sweeper
  /// Start the Sweeper
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      loop {
        // 关停信号要立即生效，不等下一个清扫刻度
        // The shutdown signal takes effect immediately, not at the next tick
        tokio::select! {
          _ = interval.tick() => {}
          _ = self.nudge.notified() => {}
        }

        if self.done.load(Ordering::Relaxed) {
          debug!("Sweeper: shutting down");
          break;
        }

        // 执行清扫
        // Execute the sweep
        if let Err(e) = self.sweep().await {
          error!("Sweeper error: {}", e);
        }
      }
    })
  }

  /// 释放每个类别的过期认领
  /// Release stale claims for each kind
  async fn sweep(&self) -> Result<u64> {
    let staleness = chrono::Duration::from_std(self.config.staleness_after)
      .unwrap_or_else(|_| chrono::Duration::seconds(600));
    let cutoff = Utc::now() - staleness;

    let mut released = 0;
    for kind in &self.kinds {
      let count = self.store.release_stale(kind, cutoff).await?;
      if count > 0 {
        warn!("Sweeper: released {} stale {} claim(s)", count, kind);
      }
      released += count;
    }
    Ok(released)
  }

  /// 停止 Sweeper
  /// Stop the Sweeper
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
    self.nudge.notify_one();
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for Sweeper {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Sweeper::start(self)
  }

  fn shutdown(&self) {
    Sweeper::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Sweeper::is_done(self)
  }
}

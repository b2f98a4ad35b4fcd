//! 内存调度存储实现
//! In-memory schedule store implementation
//!
//! 使用内存数据结构实现调度项存储，不依赖任何外部服务；用于测试和嵌入式场景
//! Implements schedule item storage with in-memory data structures, without any
//! external service dependencies; for tests and embedded use

use crate::error::{Error, Result};
use crate::item::{NewScheduleItem, ScheduleItem, ScheduleState};
use crate::store::{claimant_identity, ScheduleStore, WakeSignal, WakeStream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// 内存调度存储
/// In-memory schedule store
///
/// 认领在写锁内完成，天然满足“并发认领互斥”约束
/// Claims run under the write lock, which trivially satisfies the
/// claim-exclusivity constraint
pub struct MemoryStore {
  /// 调度项存储
  /// Schedule item storage
  storage: Arc<RwLock<HashMap<Uuid, ScheduleItem>>>,
  /// 唤醒频道发送器
  /// Wake channel sender
  wake_tx: broadcast::Sender<WakeSignal>,
  /// 本进程的认领者标识
  /// Claimant identity of this process
  claimant: String,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  /// 创建新的内存存储
  /// Create a new in-memory store
  pub fn new() -> Self {
    let (wake_tx, _) = broadcast::channel(1024);
    Self {
      storage: Arc::new(RwLock::new(HashMap::new())),
      wake_tx,
      claimant: claimant_identity(),
    }
  }

  /// 发送唤醒信号；无人订阅时静默丢弃
  /// Send a wake signal; silently dropped when nobody subscribes
  fn wake(&self, kind: &str) {
    let _ = self.wake_tx.send(WakeSignal::for_kind(kind));
  }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
  async fn ping(&self) -> Result<()> {
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    Ok(())
  }

  async fn insert(&self, item: NewScheduleItem) -> Result<ScheduleItem> {
    item.validate()?;
    let now = Utc::now();
    let stored = ScheduleItem {
      id: Uuid::new_v4(),
      kind: item.kind,
      entity_ref: item.entity_ref,
      due_at: item.due_at,
      state: ScheduleState::Pending,
      claimed_at: None,
      claimed_by: None,
      payload: item.payload,
      failure_reason: None,
      created_at: now,
      updated_at: now,
    };

    let mut storage = self.storage.write().await;
    storage.insert(stored.id, stored.clone());
    drop(storage);

    self.wake(&stored.kind);
    Ok(stored)
  }

  async fn get(&self, id: Uuid) -> Result<Option<ScheduleItem>> {
    let storage = self.storage.read().await;
    Ok(storage.get(&id).cloned())
  }

  async fn claim_due(
    &self,
    kind: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<ScheduleItem>> {
    let mut storage = self.storage.write().await;

    let mut due: Vec<(DateTime<Utc>, Uuid)> = storage
      .values()
      .filter(|item| item.state == ScheduleState::Pending && item.kind == kind && item.due_at <= now)
      .map(|item| (item.due_at, item.id))
      .collect();
    due.sort();
    due.truncate(limit);

    let mut claimed = Vec::with_capacity(due.len());
    for (_, id) in due {
      if let Some(item) = storage.get_mut(&id) {
        item.state = ScheduleState::Claimed;
        item.claimed_at = Some(now);
        item.claimed_by = Some(self.claimant.clone());
        item.updated_at = now;
        claimed.push(item.clone());
      }
    }
    Ok(claimed)
  }

  async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64> {
    let now = Utc::now();
    let mut storage = self.storage.write().await;
    let mut count = 0;
    for id in ids {
      if let Some(item) = storage.get_mut(id) {
        if item.state == ScheduleState::Claimed {
          item.state = ScheduleState::Processed;
          item.updated_at = now;
          count += 1;
        }
      }
    }
    Ok(count)
  }

  async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
    let now = Utc::now();
    let mut storage = self.storage.write().await;
    let item = storage.get_mut(&id).ok_or(Error::ItemNotFound { id })?;
    if !item.state.is_terminal() {
      item.state = ScheduleState::Failed;
      item.failure_reason = Some(reason.to_string());
      item.updated_at = now;
    }
    Ok(())
  }

  async fn cancel(&self, id: Uuid) -> Result<bool> {
    let now = Utc::now();
    let mut storage = self.storage.write().await;
    let item = storage.get_mut(&id).ok_or(Error::ItemNotFound { id })?;
    if item.state != ScheduleState::Pending {
      return Ok(false);
    }
    item.state = ScheduleState::Cancelled;
    item.updated_at = now;
    Ok(true)
  }

  async fn reschedule(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<bool> {
    let now = Utc::now();
    let mut storage = self.storage.write().await;
    let item = storage.get_mut(&id).ok_or(Error::ItemNotFound { id })?;
    if item.state != ScheduleState::Pending {
      return Ok(false);
    }
    item.due_at = due_at;
    item.updated_at = now;
    let kind = item.kind.clone();
    drop(storage);

    self.wake(&kind);
    Ok(true)
  }

  async fn earliest_pending_due(&self, kind: &str) -> Result<Option<DateTime<Utc>>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .values()
        .filter(|item| item.state == ScheduleState::Pending && item.kind == kind)
        .map(|item| item.due_at)
        .min(),
    )
  }

  async fn release_stale(&self, kind: &str, cutoff: DateTime<Utc>) -> Result<u64> {
    let now = Utc::now();
    let mut storage = self.storage.write().await;
    let mut count = 0;
    for item in storage.values_mut() {
      if item.state == ScheduleState::Claimed
        && item.kind == kind
        && item.claimed_at.map(|at| at < cutoff).unwrap_or(false)
      {
        item.state = ScheduleState::Pending;
        item.claimed_at = None;
        item.claimed_by = None;
        item.updated_at = now;
        count += 1;
      }
    }
    drop(storage);

    // 释放使行重新可认领，等同一次到期相关变更
    // A release makes rows claimable again, which counts as a due-relevant change
    if count > 0 {
      self.wake(kind);
    }
    Ok(count)
  }

  async fn subscribe_wake(&self) -> Result<WakeStream> {
    let rx = self.wake_tx.subscribe();
    let stream = BroadcastStream::new(rx).map(|result| match result {
      Ok(signal) => Ok(signal),
      // 滞后丢失的信号退化为不区分类别的唤醒
      // Signals lost to lag degrade to a kind-agnostic wake
      Err(BroadcastStreamRecvError::Lagged(_)) => Ok(WakeSignal::any()),
    });
    Ok(Box::new(stream))
  }
}

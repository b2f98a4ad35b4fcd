//! 调度存储模块
//! Schedule store module
//!
//! 定义与到期工作表交互的抽象层及其后端实现
//! Defines the abstraction layer over the due-work tables and its backend implementations

use crate::error::Result;
use crate::item::{NewScheduleItem, ScheduleItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod pgdb;

/// 唤醒信号使用的通知频道名
/// Notification channel name used for wake signals
pub const WAKE_CHANNEL: &str = "schedq_wake";

/// 唤醒信号 - 某个类别出现了新的到期相关变更
/// Wake signal - a due-relevant change happened for some kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeSignal {
  /// 触发变更的类别；None 表示来源无法区分类别，应一律检查
  /// The kind that changed; None when the source cannot attribute a kind,
  /// in which case a check is always warranted
  pub kind: Option<String>,
}

impl WakeSignal {
  /// 针对具体类别的信号
  /// Signal for a specific kind
  pub fn for_kind<S: Into<String>>(kind: S) -> Self {
    Self {
      kind: Some(kind.into()),
    }
  }

  /// 不区分类别的信号
  /// Kind-agnostic signal
  pub fn any() -> Self {
    Self { kind: None }
  }

  /// 信号是否与给定类别相关
  /// Whether the signal concerns the given kind
  pub fn concerns(&self, kind: &str) -> bool {
    match &self.kind {
      Some(k) => k == kind,
      None => true,
    }
  }
}

/// 唤醒信号流
/// Wake signal stream
pub type WakeStream = Box<dyn futures::Stream<Item = Result<WakeSignal>> + Unpin + Send>;

/// 调度存储特性，定义了与到期工作后端交互的接口
/// Schedule store trait, defines the interface for interacting with the due-work backend
///
/// 认领语义是关键约束：两个并发认领者绝不会拿到同一行
/// The claim semantics are the key constraint: two concurrent claimants never
/// receive the same row
#[async_trait]
pub trait ScheduleStore: Send + Sync {
  /// 检查后端连通性
  /// Ping the backend
  async fn ping(&self) -> Result<()>;

  /// 关闭连接
  /// Close the connection
  async fn close(&self) -> Result<()>;

  /// 写入一条新的调度项；插入会触发唤醒信号
  /// Insert a new schedule item; the insert fires a wake signal
  async fn insert(&self, item: NewScheduleItem) -> Result<ScheduleItem>;

  /// 按 ID 读取调度项
  /// Fetch a schedule item by id
  async fn get(&self, id: Uuid) -> Result<Option<ScheduleItem>>;

  /// 认领到期的待处理项
  /// Claim due pending items
  ///
  /// 单事务语义：选取 `kind` 下 `due_at <= now` 的 PENDING 行，按
  /// `(due_at, id)` 排序、行级锁跳过已锁行、最多 `limit` 条，逐行置为
  /// CLAIMED 并记录认领时间与认领者后提交。
  /// Single-transaction semantics: select PENDING rows of `kind` with
  /// `due_at <= now`, ordered by `(due_at, id)`, row-locked with skip-locked
  /// behavior, bounded by `limit`; each row is set to CLAIMED with the claim
  /// time and claimant recorded, then the transaction commits.
  async fn claim_due(
    &self,
    kind: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<ScheduleItem>>;

  /// 将已认领项标记为已处理；不在 CLAIMED 状态的 ID 被跳过
  /// Mark claimed items as processed; ids not in CLAIMED are skipped
  ///
  /// 返回实际转换的行数
  /// Returns the number of rows actually transitioned
  async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64>;

  /// 将调度项标记为永久失败
  /// Mark a schedule item as permanently failed
  ///
  /// 仅作用于 PENDING/CLAIMED 行；已进入终态的行保持不变；未知 ID 返回 `ItemNotFound`
  /// Only affects PENDING/CLAIMED rows; rows already terminal are left
  /// untouched; unknown ids yield `ItemNotFound`
  async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()>;

  /// 取消待处理项；仅 PENDING 可取消，返回是否发生转换；未知 ID 返回 `ItemNotFound`
  /// Cancel a pending item; only PENDING is cancellable, returns whether the
  /// transition happened; unknown ids yield `ItemNotFound`
  async fn cancel(&self, id: Uuid) -> Result<bool>;

  /// 修改待处理项的到期时间；仅 PENDING 可修改，修改会触发唤醒信号
  /// Change the due time of a pending item; only PENDING is mutable, and the
  /// change fires a wake signal
  async fn reschedule(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<bool>;

  /// 查询某类别最早的待处理到期时间（无锁），用于确定守护进程的睡眠时长
  /// Earliest pending due time for a kind (non-locking), used to size the
  /// daemon's sleep
  async fn earliest_pending_due(&self, kind: &str) -> Result<Option<DateTime<Utc>>>;

  /// 释放过期认领：认领时间早于 cutoff 的 CLAIMED 行回到 PENDING
  /// Release stale claims: CLAIMED rows claimed before cutoff return to PENDING
  ///
  /// 返回释放的行数
  /// Returns the number of rows released
  async fn release_stale(&self, kind: &str, cutoff: DateTime<Utc>) -> Result<u64>;

  /// 订阅唤醒信号
  /// Subscribe to wake signals
  async fn subscribe_wake(&self) -> Result<WakeStream>;
}

/// 生成认领者标识 `host:pid:nonce`
/// Generate a claimant identity `host:pid:nonce`
pub fn claimant_identity() -> String {
  let host = hostname::get()
    .unwrap_or_default()
    .to_string_lossy()
    .to_string();
  let pid = std::process::id();
  let nonce = Uuid::new_v4().simple().to_string();
  format!("{}:{}:{}", host, pid, &nonce[..8])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wake_signal_concerns() {
    assert!(WakeSignal::for_kind("reminder").concerns("reminder"));
    assert!(!WakeSignal::for_kind("reminder").concerns("followup"));
    assert!(WakeSignal::any().concerns("reminder"));
  }

  #[test]
  fn test_claimant_identity_shape() {
    let id = claimant_identity();
    let parts: Vec<&str> = id.split(':').collect();
    assert_eq!(parts.len(), 3);
    assert!(!parts[2].is_empty());
    assert_ne!(claimant_identity(), id);
  }
}

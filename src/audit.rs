//! 终点失败审计
//! Terminal failure audit
//!
//! 重试次数耗尽的消息在被丢弃前落地为审计记录，供人工排查和补发
//! Messages that exhaust their retries are persisted as audit records before
//! being dropped, for manual inspection and replay

use crate::error::Result;
use crate::message::TerminalFailure;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 审计落地接口
/// Audit sink interface
///
/// `record` 以 message_id 幂等：同一消息的重复终点只保留一条记录
/// `record` is idempotent on message_id: repeated terminal outcomes for the
/// same message keep a single record
#[async_trait]
pub trait AuditSink: Send + Sync {
  /// 写入一条终点失败记录
  /// Write a terminal failure record
  async fn record(&self, failure: &TerminalFailure) -> Result<()>;

  /// 读取最近的终点失败记录，按失败时间倒序
  /// Read recent terminal failure records, newest first
  async fn recent(&self, limit: usize) -> Result<Vec<TerminalFailure>>;
}

/// 内存审计实现
/// In-memory audit implementation
#[derive(Default)]
pub struct MemoryAuditSink {
  records: Arc<RwLock<Vec<TerminalFailure>>>,
}

impl MemoryAuditSink {
  /// 创建新的内存审计落地
  /// Create a new in-memory audit sink
  pub fn new() -> Self {
    Self::default()
  }

  /// 按消息 ID 查找记录
  /// Look up a record by message id
  pub async fn find(&self, message_id: Uuid) -> Option<TerminalFailure> {
    let records = self.records.read().await;
    records.iter().find(|r| r.message_id == message_id).cloned()
  }

  /// 当前记录数
  /// Current record count
  pub async fn len(&self) -> usize {
    self.records.read().await.len()
  }

  /// 是否为空
  /// Whether the sink is empty
  pub async fn is_empty(&self) -> bool {
    self.records.read().await.is_empty()
  }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
  async fn record(&self, failure: &TerminalFailure) -> Result<()> {
    let mut records = self.records.write().await;
    match records.iter_mut().find(|r| r.message_id == failure.message_id) {
      Some(existing) => *existing = failure.clone(),
      None => records.push(failure.clone()),
    }
    Ok(())
  }

  async fn recent(&self, limit: usize) -> Result<Vec<TerminalFailure>> {
    let records = self.records.read().await;
    let mut out: Vec<TerminalFailure> = records.clone();
    out.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
    out.truncate(limit);
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, Utc};
  use serde_json::json;

  fn failure(message_id: Uuid, reason: &str, age_secs: i64) -> TerminalFailure {
    TerminalFailure {
      message_id,
      kind: "reminder".to_string(),
      entity_ref: "session/42".to_string(),
      payload: json!({"note": "hello"}),
      failure_reason: reason.to_string(),
      failed_at: Utc::now() - Duration::seconds(age_secs),
      attempt_count: 5,
    }
  }

  #[tokio::test]
  async fn test_record_is_idempotent_on_message_id() {
    let sink = MemoryAuditSink::new();
    let id = Uuid::new_v4();

    sink.record(&failure(id, "timeout", 10)).await.unwrap();
    sink.record(&failure(id, "connection refused", 5)).await.unwrap();

    assert_eq!(sink.len().await, 1);
    let stored = sink.find(id).await.unwrap();
    assert_eq!(stored.failure_reason, "connection refused");
  }

  #[tokio::test]
  async fn test_recent_orders_newest_first() {
    let sink = MemoryAuditSink::new();
    let old = Uuid::new_v4();
    let new = Uuid::new_v4();
    sink.record(&failure(old, "old", 60)).await.unwrap();
    sink.record(&failure(new, "new", 1)).await.unwrap();

    let recent = sink.recent(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].message_id, new);
    assert_eq!(recent[1].message_id, old);

    let limited = sink.recent(1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].message_id, new);
  }
}

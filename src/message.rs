//! 出站消息模块
//! Outbound message module
//!
//! 定义发布到事件总线的消息及终态失败审计记录
//! Defines messages published to the event bus and the terminal failure audit record

use crate::item::ScheduleItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息负载的结构版本号
/// Schema version of the message payload
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

/// 派生确定性消息 ID 的固定命名空间
/// Fixed namespace for deriving deterministic message ids
const MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x7b1e4a5d9c3f4e82a6d05f4721c98b3a);

/// 出站消息 - 发布到事件总线的单元
/// Outbound message - the unit published to the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
  /// 确定性消息 ID；同一调度项的重复发布得到相同 ID，供下游去重
  /// Deterministic message id; re-publication of the same item yields the
  /// same id, so downstream consumers can deduplicate
  pub message_id: Uuid,
  /// 主题路由键，形如 `<scope>.<kind>`
  /// Topic routing key of the form `<scope>.<kind>`
  pub routing_key: String,
  /// 带版本的 JSON 信封
  /// Versioned JSON envelope
  pub payload: serde_json::Value,
  /// 投递尝试次数，首次发布为 0，由重试守护进程递增
  /// Delivery attempt count, 0 on first publication, incremented by the retry daemon
  pub attempt_count: u32,
}

impl OutboundMessage {
  /// 为调度项构建信封消息
  /// Build an envelope message for a schedule item
  ///
  /// 信封字段 / Envelope fields:
  /// `schema_version`, `message_id`, `kind`, `entity_ref`, `occurred_at`, `data`
  pub fn envelope(item: &ScheduleItem, scope: &str, data: serde_json::Value) -> Self {
    let message_id = message_id_for(item);
    let payload = serde_json::json!({
      "schema_version": ENVELOPE_SCHEMA_VERSION,
      "message_id": message_id,
      "kind": item.kind,
      "entity_ref": item.entity_ref,
      "occurred_at": Utc::now(),
      "data": data,
    });
    Self {
      message_id,
      routing_key: routing_key(scope, &item.kind),
      payload,
      attempt_count: 0,
    }
  }

  /// 读取信封中的类别
  /// Read the kind from the envelope
  pub fn kind(&self) -> Option<&str> {
    self.payload.get("kind").and_then(|v| v.as_str())
  }

  /// 读取信封中的实体引用
  /// Read the entity reference from the envelope
  pub fn entity_ref(&self) -> Option<&str> {
    self.payload.get("entity_ref").and_then(|v| v.as_str())
  }

  /// 返回尝试次数加一的副本，用于延迟重投
  /// Return a copy with the attempt count incremented, for delayed redelivery
  pub fn next_attempt(&self) -> Self {
    let mut next = self.clone();
    next.attempt_count += 1;
    next
  }
}

/// 为调度项派生确定性消息 ID
/// Derive the deterministic message id for a schedule item
///
/// 对 `entity_ref:kind:id` 做 UUIDv5，保证跨重发稳定、跨调度项互异
/// UUIDv5 over `entity_ref:kind:id` - stable across re-publication, distinct across items
pub fn message_id_for(item: &ScheduleItem) -> Uuid {
  let name = format!("{}:{}:{}", item.entity_ref, item.kind, item.id);
  Uuid::new_v5(&MESSAGE_NAMESPACE, name.as_bytes())
}

/// 组合路由键
/// Compose a routing key
pub fn routing_key(scope: &str, kind: &str) -> String {
  format!("{scope}.{kind}")
}

/// 终态失败审计记录
/// Terminal failure audit record
///
/// 重试次数耗尽后写入审计槽的完整记录
/// The full record written to the audit sink once retries are exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalFailure {
  pub message_id: Uuid,
  pub kind: String,
  pub entity_ref: String,
  pub payload: serde_json::Value,
  pub failure_reason: String,
  pub failed_at: DateTime<Utc>,
  pub attempt_count: u32,
}

impl TerminalFailure {
  /// 从出站消息构建审计记录
  /// Build an audit record from an outbound message
  pub fn for_message(message: &OutboundMessage, failure_reason: String) -> Self {
    Self {
      message_id: message.message_id,
      kind: message.kind().unwrap_or_default().to_string(),
      entity_ref: message.entity_ref().unwrap_or_default().to_string(),
      payload: message.payload.clone(),
      failure_reason,
      failed_at: Utc::now(),
      attempt_count: message.attempt_count,
    }
  }
}

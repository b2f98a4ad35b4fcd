//! 调度项模块
//! Schedule item module
//!
//! 定义调度存储中的核心数据类型：调度项及其状态机
//! Defines the core data types of the schedule store: schedule items and their state machine

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// 调度项状态
/// Schedule item state
///
/// 状态机 / State machine:
/// `PENDING -> CLAIMED -> PROCESSED`；`CLAIMED -> PENDING` 仅由过期清扫执行；
/// `PENDING -> CANCELLED` 和 `-> FAILED` 为终态。
/// `PENDING -> CLAIMED -> PROCESSED`; `CLAIMED -> PENDING` only via the staleness sweep;
/// `PENDING -> CANCELLED` and `-> FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
  /// 待处理
  /// Pending
  Pending,
  /// 已被某个守护进程认领
  /// Claimed by a daemon
  Claimed,
  /// 已处理完成
  /// Processed
  Processed,
  /// 已取消
  /// Cancelled
  Cancelled,
  /// 构建事件永久失败
  /// Permanent event build failure
  Failed,
}

impl ScheduleState {
  /// 转换为字符串
  /// Convert to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Claimed => "claimed",
      Self::Processed => "processed",
      Self::Cancelled => "cancelled",
      Self::Failed => "failed",
    }
  }

  /// 是否为终态
  /// Whether the state is terminal
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Processed | Self::Cancelled | Self::Failed)
  }
}

impl FromStr for ScheduleState {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "claimed" => Ok(Self::Claimed),
      "processed" => Ok(Self::Processed),
      "cancelled" => Ok(Self::Cancelled),
      "failed" => Ok(Self::Failed),
      _ => Err(()),
    }
  }
}

/// 调度项 - 一条到期即需发布事件的行
/// Schedule item - a row that requires event publication once due
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
  /// 稳定的不透明主键
  /// Stable opaque key
  pub id: Uuid,
  /// 调度类别，例如 "reminder"
  /// Schedule kind, e.g. "reminder"
  pub kind: String,
  /// 所属实体的不透明引用
  /// Opaque reference to the owning entity
  pub entity_ref: String,
  /// 到期时间
  /// Due time
  pub due_at: DateTime<Utc>,
  /// 当前状态
  /// Current state
  pub state: ScheduleState,
  /// 认领时间（进入 CLAIMED 时写入）
  /// Claim time (set on transition to CLAIMED)
  pub claimed_at: Option<DateTime<Utc>>,
  /// 认领者标识，用于诊断
  /// Claimant identity, for diagnostics
  pub claimed_by: Option<String>,
  /// 类别相关的负载片段
  /// Kind-specific payload fragment
  pub payload: serde_json::Value,
  /// 永久失败原因（进入 FAILED 时写入）
  /// Permanent failure reason (set on transition to FAILED)
  pub failure_reason: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// 新建调度项的输入
/// Input for creating a schedule item
#[derive(Debug, Clone)]
pub struct NewScheduleItem {
  pub kind: String,
  pub entity_ref: String,
  pub due_at: DateTime<Utc>,
  pub payload: serde_json::Value,
}

impl NewScheduleItem {
  /// 创建新的调度项输入
  /// Create a new schedule item input
  pub fn new<K, E>(kind: K, entity_ref: E, due_at: DateTime<Utc>) -> Self
  where
    K: Into<String>,
    E: Into<String>,
  {
    Self {
      kind: kind.into(),
      entity_ref: entity_ref.into(),
      due_at,
      payload: serde_json::Value::Null,
    }
  }

  /// 设置负载
  /// Set the payload
  pub fn payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = payload;
    self
  }

  /// 校验输入
  /// Validate the input
  pub fn validate(&self) -> Result<()> {
    validate_kind(&self.kind)?;
    if self.entity_ref.is_empty() {
      return Err(Error::store("entity_ref must not be empty"));
    }
    Ok(())
  }
}

/// 校验调度类别名称
/// Validate a schedule kind name
///
/// 类别会成为路由键的一个点分段，因此不允许包含 '.' 和空白字符
/// Kinds become one dot-segment of the routing key, so '.' and whitespace are not allowed
pub fn validate_kind(kind: &str) -> Result<()> {
  let valid = !kind.is_empty()
    && kind
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-');
  if valid {
    Ok(())
  } else {
    Err(Error::InvalidKind {
      kind: kind.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_state_conversion() {
    assert_eq!(ScheduleState::Pending.as_str(), "pending");
    assert_eq!(
      "claimed".parse::<ScheduleState>(),
      Ok(ScheduleState::Claimed)
    );
    assert!("invalid".parse::<ScheduleState>().is_err());
  }

  #[test]
  fn test_terminal_states() {
    assert!(!ScheduleState::Pending.is_terminal());
    assert!(!ScheduleState::Claimed.is_terminal());
    assert!(ScheduleState::Processed.is_terminal());
    assert!(ScheduleState::Cancelled.is_terminal());
    assert!(ScheduleState::Failed.is_terminal());
  }

  #[test]
  fn test_validate_kind() {
    assert!(validate_kind("reminder").is_ok());
    assert!(validate_kind("session:expiry").is_ok());
    assert!(validate_kind("follow-up_2").is_ok());
    assert!(validate_kind("").is_err());
    assert!(validate_kind("bad.kind").is_err());
    assert!(validate_kind("bad kind").is_err());
  }

  #[test]
  fn test_new_item_validation() {
    let item = NewScheduleItem::new("reminder", "session/42", Utc::now());
    assert!(item.validate().is_ok());

    let item = NewScheduleItem::new("reminder", "", Utc::now());
    assert!(item.validate().is_err());
  }
}

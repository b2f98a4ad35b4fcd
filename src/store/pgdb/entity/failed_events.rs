//! 终点失败审计实体
//! Terminal failure audit entity

use crate::message::TerminalFailure;
use sea_orm::entity::prelude::*;

/// 终点失败记录实体模型
/// Terminal failure record entity model
///
/// message_id 作主键实现幂等落地
/// message_id as primary key gives idempotent persistence
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "failed_events")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub message_id: Uuid,
  pub kind: String,
  pub entity_ref: String,
  pub payload: serde_json::Value,
  pub failure_reason: String,
  pub failed_at: DateTimeWithTimeZone,
  pub attempt_count: i32,
  pub recorded_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
  /// 转换为领域失败记录
  /// Convert into the domain failure record
  pub fn into_failure(self) -> TerminalFailure {
    TerminalFailure {
      message_id: self.message_id,
      kind: self.kind,
      entity_ref: self.entity_ref,
      payload: self.payload,
      failure_reason: self.failure_reason,
      failed_at: self.failed_at.into(),
      attempt_count: self.attempt_count.max(0) as u32,
    }
  }
}

//! 调度项实体
//! Schedule item entity

use crate::item::{self, ScheduleItem};
use sea_orm::entity::prelude::*;

/// 调度项状态枚举
/// Schedule item state enum
#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(50))")]
pub enum ScheduleState {
  #[sea_orm(string_value = "pending")]
  Pending,
  #[sea_orm(string_value = "claimed")]
  Claimed,
  #[sea_orm(string_value = "processed")]
  Processed,
  #[sea_orm(string_value = "cancelled")]
  Cancelled,
  #[sea_orm(string_value = "failed")]
  Failed,
}

impl From<item::ScheduleState> for ScheduleState {
  fn from(state: item::ScheduleState) -> Self {
    match state {
      item::ScheduleState::Pending => Self::Pending,
      item::ScheduleState::Claimed => Self::Claimed,
      item::ScheduleState::Processed => Self::Processed,
      item::ScheduleState::Cancelled => Self::Cancelled,
      item::ScheduleState::Failed => Self::Failed,
    }
  }
}

impl From<ScheduleState> for item::ScheduleState {
  fn from(state: ScheduleState) -> Self {
    match state {
      ScheduleState::Pending => Self::Pending,
      ScheduleState::Claimed => Self::Claimed,
      ScheduleState::Processed => Self::Processed,
      ScheduleState::Cancelled => Self::Cancelled,
      ScheduleState::Failed => Self::Failed,
    }
  }
}

/// 调度项实体模型
/// Schedule item entity model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "schedule_items")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub id: Uuid,
  pub kind: String,
  pub entity_ref: String,
  pub due_at: DateTimeWithTimeZone,
  pub state: ScheduleState,
  pub claimed_at: Option<DateTimeWithTimeZone>,
  pub claimed_by: Option<String>,
  pub payload: serde_json::Value,
  pub failure_reason: Option<String>,
  pub created_at: DateTimeWithTimeZone,
  pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
  /// 转换为领域调度项
  /// Convert into the domain schedule item
  pub fn into_item(self) -> ScheduleItem {
    ScheduleItem {
      id: self.id,
      kind: self.kind,
      entity_ref: self.entity_ref,
      due_at: self.due_at.into(),
      state: self.state.into(),
      claimed_at: self.claimed_at.map(|dt| dt.into()),
      claimed_by: self.claimed_by,
      payload: self.payload,
      failure_reason: self.failure_reason,
      created_at: self.created_at.into(),
      updated_at: self.updated_at.into(),
    }
  }
}

//! 预导入模块
//! Prelude module

pub use super::failed_events::Entity as FailedEvents;
pub use super::schedule_items::Entity as ScheduleItems;

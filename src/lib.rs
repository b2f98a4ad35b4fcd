//! # Schedq
//!
//! Event-driven due-time scheduling and event publication in Rust
//!
//! Schedq 维护一张到期工作表，在调度项到点时把它们变成事件发布到持久化总线上。
//! Schedq keeps a table of due work and turns schedule items into events on a
//! durable bus the moment they come due.
//! 会话服务把"何时"交给它，自己只消费"已经发生"。
//! Session services hand it the "when" and only consume the "already happened".
//!
//! ## 特性
//! ## Features
//!
//! - 到点即发：调度项在到期时刻被认领、构建并发布
//!   - Due-time publication: items are claimed, built, and published at their due instant
//! - 推送唤醒加兜底轮询，唤醒丢失也不会漏发
//!   - Push wakes plus a safety-net poll, so a lost wake never loses work
//! - SKIP LOCKED 认领，多进程部署天然分片
//!   - SKIP LOCKED claims partition work naturally across processes
//! - 认领者崩溃后由清扫释放过期认领，工作不会丢失
//!   - Stale claims from crashed claimants are released by the sweep, no work is lost
//! - 失败消息按指数退避重投，耗尽后写入终态失败审计
//!   - Failed messages redeliver with exponential backoff, then land in a terminal failure audit
//! - 确定性消息 ID，重发可被下游去重
//!   - Deterministic message ids let downstream consumers dedupe redeliveries
//! - 主题交换式路由键 `<scope>.<kind>`，按段通配订阅
//!   - Topic-exchange routing keys `<scope>.<kind>` with per-segment wildcard bindings
//! - 生产后端为 PostgreSQL 与 Redis Streams，内存后端用于测试与起步
//!   - PostgreSQL and Redis Streams in production, in-memory backends for tests and getting started
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use schedq::audit::MemoryAuditSink;
//! use schedq::bus::memory::MemoryBus;
//! use schedq::config::EngineConfig;
//! use schedq::engine::Engine;
//! use schedq::item::NewScheduleItem;
//! use schedq::message::OutboundMessage;
//! use schedq::store::memory::MemoryStore;
//! use chrono::{Duration, Utc};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 内存后端便于起步；生产部署换成 PostgresStore 和 RedisBus
//!     // The in-memory backends get you started; production swaps in
//!     // PostgresStore and RedisBus
//!     let store = Arc::new(MemoryStore::new());
//!     let bus = Arc::new(MemoryBus::new());
//!     let audit = Arc::new(MemoryAuditSink::new());
//!
//!     let mut engine = Engine::new(store, bus, audit, EngineConfig::default())?;
//!
//!     // 每个类别一个构建器，把到期项变成出站事件
//!     // One builder per kind turns due items into outbound events
//!     engine.register_fn("reminder", |item| {
//!         Ok(OutboundMessage::envelope(item, "global", item.payload.clone()))
//!     })?;
//!
//!     // 半小时后触发的提醒
//!     // A reminder firing in half an hour
//!     engine
//!         .schedule(
//!             NewScheduleItem::new("reminder", "session/42", Utc::now() + Duration::minutes(30))
//!                 .payload(serde_json::json!({"text": "wrap up"})),
//!         )
//!         .await?;
//!
//!     engine.run().await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod builder;
pub mod bus;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod item;
pub mod message;
pub mod publisher;
pub mod store;

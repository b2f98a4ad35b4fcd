//! PostgresSQL 存储模块
//! PostgresSQL storage module
//!
//! 定义了与 PostgresSQL 交互的抽象层
//! Defines the abstraction layer for interacting with PostgresSQL

mod audit;
pub mod entity;
mod store;

pub use audit::PgAuditSink;
pub use store::PostgresStore;

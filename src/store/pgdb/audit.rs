//! PostgresSQL 审计落地实现
//! PostgresSQL audit sink implementation

use crate::audit::AuditSink;
use crate::error::Result;
use crate::message::TerminalFailure;
use crate::store::pgdb::entity::failed_events;
use crate::store::pgdb::entity::FailedEvents;
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
  ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryOrder,
  QuerySelect, Schema, Set, Statement,
};

/// PostgresSQL 审计落地
/// PostgresSQL audit sink
pub struct PgAuditSink {
  db: DatabaseConnection,
}

impl PgAuditSink {
  /// 从连接字符串创建新的审计落地实例
  /// Create a new audit sink instance from a connection string
  pub async fn new(database_url: &str) -> Result<Self> {
    let opt = ConnectOptions::new(database_url)
      .max_connections(5)
      .to_owned();
    let db = Database::connect(opt).await?;
    let sink = Self::from_connection(db);
    sink.init_schema().await?;
    Ok(sink)
  }

  /// 从现有数据库连接创建审计落地实例
  /// Create an audit sink instance from an existing database connection
  pub fn from_connection(db: DatabaseConnection) -> Self {
    Self { db }
  }

  /// 初始化数据库 schema
  /// Initialize database schema
  pub async fn init_schema(&self) -> Result<()> {
    let backend = self.db.get_database_backend();
    let schema = Schema::new(backend);

    let mut stmt = schema.create_table_from_entity(FailedEvents);
    stmt.if_not_exists();
    self.db.execute(backend.build(&stmt)).await?;

    let index_sql =
      "CREATE INDEX IF NOT EXISTS idx_failed_events_failed_at ON failed_events(failed_at DESC)";
    self
      .db
      .execute(Statement::from_string(backend, index_sql))
      .await?;
    Ok(())
  }
}

#[async_trait]
impl AuditSink for PgAuditSink {
  async fn record(&self, failure: &TerminalFailure) -> Result<()> {
    let active = failed_events::ActiveModel {
      message_id: Set(failure.message_id),
      kind: Set(failure.kind.clone()),
      entity_ref: Set(failure.entity_ref.clone()),
      payload: Set(failure.payload.clone()),
      failure_reason: Set(failure.failure_reason.clone()),
      failed_at: Set(failure.failed_at.into()),
      attempt_count: Set(failure.attempt_count as i32),
      recorded_at: Set(Utc::now().into()),
    };

    // 同一 message_id 的重复终点保持首条记录不变
    // Repeated terminal outcomes for the same message_id keep the first record
    let insert = FailedEvents::insert(active).on_conflict(
      OnConflict::column(failed_events::Column::MessageId)
        .do_nothing()
        .to_owned(),
    );
    match insert.exec(&self.db).await {
      Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  async fn recent(&self, limit: usize) -> Result<Vec<TerminalFailure>> {
    let models = FailedEvents::find()
      .order_by_desc(failed_events::Column::FailedAt)
      .limit(limit as u64)
      .all(&self.db)
      .await?;
    Ok(models.into_iter().map(|m| m.into_failure()).collect())
  }
}

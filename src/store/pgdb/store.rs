//! PostgresSQL 调度存储实现
//! PostgresSQL schedule store implementation
//!
//! 使用 SeaORM 实现基于 PostgresSQL 的调度项存储；认领依赖行级锁，
//! 唤醒信号依赖 LISTEN/NOTIFY
//! Implements schedule item storage based on PostgresSQL using SeaORM; claims
//! rely on row-level locks, wake signals on LISTEN/NOTIFY

use crate::error::{Error, Result};
use crate::item::{NewScheduleItem, ScheduleItem};
use crate::store::pgdb::entity::schedule_items::{self, ScheduleState};
use crate::store::pgdb::entity::ScheduleItems;
use crate::store::{claimant_identity, ScheduleStore, WakeSignal, WakeStream, WAKE_CHANNEL};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
  ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
  EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema, Set, Statement, TransactionTrait,
};
use sqlx::postgres::PgListener;
use uuid::Uuid;

/// 认领事务内单条语句的超时（毫秒）
/// Per-statement timeout inside the claim transaction, in milliseconds
const CLAIM_STATEMENT_TIMEOUT_MS: u64 = 5_000;

/// PostgresSQL 调度存储
/// PostgresSQL schedule store
pub struct PostgresStore {
  db: DatabaseConnection,
  /// 本进程的认领者标识
  /// Claimant identity of this process
  claimant: String,
}

impl PostgresStore {
  /// 从连接字符串创建新的存储实例
  /// Create a new store instance from a connection string
  pub async fn new(database_url: &str) -> Result<Self> {
    let opt = ConnectOptions::new(database_url)
      .max_connections(10)
      .to_owned();
    let db = Database::connect(opt).await?;
    let store = Self::from_connection(db);
    store.init_schema().await?;
    Ok(store)
  }

  /// 从现有数据库连接创建存储实例
  /// Create a store instance from an existing database connection
  pub fn from_connection(db: DatabaseConnection) -> Self {
    Self {
      db,
      claimant: claimant_identity(),
    }
  }

  /// 获取数据库连接
  /// Get the database connection
  pub fn db(&self) -> &DatabaseConnection {
    &self.db
  }

  /// 初始化数据库 schema
  /// Initialize database schema
  ///
  /// 建表、部分索引和唤醒触发器；全部幂等，可在每次启动时执行
  /// Creates the table, partial indexes and the wake trigger; all idempotent,
  /// safe to run on every startup
  pub async fn init_schema(&self) -> Result<()> {
    let backend = self.db.get_database_backend();
    let schema = Schema::new(backend);

    let mut stmt = schema.create_table_from_entity(ScheduleItems);
    stmt.if_not_exists();
    self.db.execute(backend.build(&stmt)).await?;

    // 触发器函数体含 $ 引用，逐条执行而不是拼成一个批
    // The trigger function body uses $-quoting; run one statement per call
    // instead of batching
    let ddl = [
      "CREATE INDEX IF NOT EXISTS idx_schedule_items_due ON schedule_items(kind, due_at) \
       WHERE state = 'pending'"
        .to_string(),
      "CREATE INDEX IF NOT EXISTS idx_schedule_items_claimed ON schedule_items(kind, claimed_at) \
       WHERE state = 'claimed'"
        .to_string(),
      format!(
        "CREATE OR REPLACE FUNCTION schedq_notify_wake() RETURNS trigger AS $$\n\
         BEGIN\n\
           PERFORM pg_notify('{WAKE_CHANNEL}', NEW.kind);\n\
           RETURN NEW;\n\
         END;\n\
         $$ LANGUAGE plpgsql"
      ),
      "DROP TRIGGER IF EXISTS schedule_items_wake_insert ON schedule_items".to_string(),
      "CREATE TRIGGER schedule_items_wake_insert AFTER INSERT ON schedule_items \
       FOR EACH ROW WHEN (NEW.state = 'pending') \
       EXECUTE FUNCTION schedq_notify_wake()"
        .to_string(),
      "DROP TRIGGER IF EXISTS schedule_items_wake_update ON schedule_items".to_string(),
      // 更新触发器覆盖改期和释放回 PENDING 两种到期相关变更
      // The update trigger covers both reschedules and releases back to PENDING
      "CREATE TRIGGER schedule_items_wake_update AFTER UPDATE ON schedule_items \
       FOR EACH ROW WHEN (NEW.state = 'pending' AND \
       (OLD.due_at IS DISTINCT FROM NEW.due_at OR OLD.state IS DISTINCT FROM NEW.state)) \
       EXECUTE FUNCTION schedq_notify_wake()"
        .to_string(),
    ];
    for sql in ddl {
      self.db.execute(Statement::from_string(backend, sql)).await?;
    }

    Ok(())
  }
}

#[async_trait]
impl ScheduleStore for PostgresStore {
  async fn ping(&self) -> Result<()> {
    // Execute a simple query to test connection
    let _ = ScheduleItems::find().limit(1).one(&self.db).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.db.clone().close().await?;
    Ok(())
  }

  async fn insert(&self, item: NewScheduleItem) -> Result<ScheduleItem> {
    item.validate()?;
    let now = Utc::now();
    let active = schedule_items::ActiveModel {
      id: Set(Uuid::new_v4()),
      kind: Set(item.kind),
      entity_ref: Set(item.entity_ref),
      due_at: Set(item.due_at.into()),
      state: Set(ScheduleState::Pending),
      claimed_at: Set(None),
      claimed_by: Set(None),
      payload: Set(item.payload),
      failure_reason: Set(None),
      created_at: Set(now.into()),
      updated_at: Set(now.into()),
    };
    // 插入触发器负责发送唤醒通知
    // The insert trigger takes care of the wake notification
    let model = active.insert(&self.db).await?;
    Ok(model.into_item())
  }

  async fn get(&self, id: Uuid) -> Result<Option<ScheduleItem>> {
    let model = ScheduleItems::find_by_id(id).one(&self.db).await?;
    Ok(model.map(|m| m.into_item()))
  }

  async fn claim_due(
    &self,
    kind: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<ScheduleItem>> {
    // 行锁必须在认领更新提交前一直持有，因此选择和更新共用一个事务
    // Row locks must be held until the claiming update commits, so the select
    // and the updates share one transaction
    let txn = self.db.begin().await?;
    txn
      .execute(Statement::from_string(
        self.db.get_database_backend(),
        format!("SET LOCAL statement_timeout = {CLAIM_STATEMENT_TIMEOUT_MS}"),
      ))
      .await?;

    let due = ScheduleItems::find()
      .filter(schedule_items::Column::Kind.eq(kind))
      .filter(schedule_items::Column::State.eq(ScheduleState::Pending))
      .filter(schedule_items::Column::DueAt.lte(now))
      .order_by_asc(schedule_items::Column::DueAt)
      .order_by_asc(schedule_items::Column::Id)
      .limit(limit as u64)
      .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
      .all(&txn)
      .await?;

    let mut claimed = Vec::with_capacity(due.len());
    for model in due {
      let mut active: schedule_items::ActiveModel = model.into();
      active.state = Set(ScheduleState::Claimed);
      active.claimed_at = Set(Some(now.into()));
      active.claimed_by = Set(Some(self.claimant.clone()));
      active.updated_at = Set(now.into());
      let updated = active.update(&txn).await?;
      claimed.push(updated.into_item());
    }

    txn.commit().await?;
    Ok(claimed)
  }

  async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64> {
    if ids.is_empty() {
      return Ok(0);
    }
    let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
    let result = ScheduleItems::update_many()
      .col_expr(
        schedule_items::Column::State,
        Expr::value(ScheduleState::Processed),
      )
      .col_expr(schedule_items::Column::UpdatedAt, Expr::value(now))
      .filter(schedule_items::Column::Id.is_in(ids.iter().copied()))
      .filter(schedule_items::Column::State.eq(ScheduleState::Claimed))
      .exec(&self.db)
      .await?;
    Ok(result.rows_affected)
  }

  async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
    let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
    // WHERE 子句里的状态守卫保证检查和写入原子
    // The state guard in the WHERE clause keeps check-and-set atomic
    let result = ScheduleItems::update_many()
      .col_expr(
        schedule_items::Column::State,
        Expr::value(ScheduleState::Failed),
      )
      .col_expr(
        schedule_items::Column::FailureReason,
        Expr::value(Some(reason.to_string())),
      )
      .col_expr(schedule_items::Column::UpdatedAt, Expr::value(now))
      .filter(schedule_items::Column::Id.eq(id))
      .filter(
        schedule_items::Column::State.is_in([ScheduleState::Pending, ScheduleState::Claimed]),
      )
      .exec(&self.db)
      .await?;
    if result.rows_affected > 0 {
      return Ok(());
    }
    // 区分终态无操作和未知 ID
    // Distinguish the terminal-state no-op from an unknown id
    match ScheduleItems::find_by_id(id).one(&self.db).await? {
      Some(_) => Ok(()),
      None => Err(Error::ItemNotFound { id }),
    }
  }

  async fn cancel(&self, id: Uuid) -> Result<bool> {
    let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
    let result = ScheduleItems::update_many()
      .col_expr(
        schedule_items::Column::State,
        Expr::value(ScheduleState::Cancelled),
      )
      .col_expr(schedule_items::Column::UpdatedAt, Expr::value(now))
      .filter(schedule_items::Column::Id.eq(id))
      .filter(schedule_items::Column::State.eq(ScheduleState::Pending))
      .exec(&self.db)
      .await?;
    if result.rows_affected > 0 {
      return Ok(true);
    }
    match ScheduleItems::find_by_id(id).one(&self.db).await? {
      Some(_) => Ok(false),
      None => Err(Error::ItemNotFound { id }),
    }
  }

  async fn reschedule(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<bool> {
    let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
    let due: sea_orm::prelude::DateTimeWithTimeZone = due_at.into();
    // due_at 变更由更新触发器转成唤醒通知
    // The due_at change is turned into a wake notification by the update trigger
    let result = ScheduleItems::update_many()
      .col_expr(schedule_items::Column::DueAt, Expr::value(due))
      .col_expr(schedule_items::Column::UpdatedAt, Expr::value(now))
      .filter(schedule_items::Column::Id.eq(id))
      .filter(schedule_items::Column::State.eq(ScheduleState::Pending))
      .exec(&self.db)
      .await?;
    if result.rows_affected > 0 {
      return Ok(true);
    }
    match ScheduleItems::find_by_id(id).one(&self.db).await? {
      Some(_) => Ok(false),
      None => Err(Error::ItemNotFound { id }),
    }
  }

  async fn earliest_pending_due(&self, kind: &str) -> Result<Option<DateTime<Utc>>> {
    let model = ScheduleItems::find()
      .filter(schedule_items::Column::Kind.eq(kind))
      .filter(schedule_items::Column::State.eq(ScheduleState::Pending))
      .order_by_asc(schedule_items::Column::DueAt)
      .limit(1)
      .one(&self.db)
      .await?;
    Ok(model.map(|m| m.due_at.into()))
  }

  async fn release_stale(&self, kind: &str, cutoff: DateTime<Utc>) -> Result<u64> {
    let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
    let result = ScheduleItems::update_many()
      .col_expr(
        schedule_items::Column::State,
        Expr::value(ScheduleState::Pending),
      )
      .col_expr(
        schedule_items::Column::ClaimedAt,
        Expr::value(None::<sea_orm::prelude::DateTimeWithTimeZone>),
      )
      .col_expr(
        schedule_items::Column::ClaimedBy,
        Expr::value(None::<String>),
      )
      .col_expr(schedule_items::Column::UpdatedAt, Expr::value(now))
      .filter(schedule_items::Column::Kind.eq(kind))
      .filter(schedule_items::Column::State.eq(ScheduleState::Claimed))
      .filter(schedule_items::Column::ClaimedAt.lt(cutoff))
      .exec(&self.db)
      .await?;
    Ok(result.rows_affected)
  }

  async fn subscribe_wake(&self) -> Result<WakeStream> {
    let pool = self.db.get_postgres_connection_pool();
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(WAKE_CHANNEL).await?;

    let stream = listener.into_stream().map(|result| {
      result
        .map(|notification| {
          let kind = notification.payload();
          if kind.is_empty() {
            WakeSignal::any()
          } else {
            WakeSignal::for_kind(kind)
          }
        })
        .map_err(Error::from)
    });
    Ok(Box::new(stream))
  }
}

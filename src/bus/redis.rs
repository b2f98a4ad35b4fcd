//! Redis Streams 事件总线实现
//! Redis Streams event bus implementation
//!
//! 每个队列一个 stream，绑定表驱动主题路由；延迟消息放在有序集合里，
//! 死信走独立 stream
//! One stream per queue, topic routing driven by a binding table; delayed
//! messages live in a sorted set, dead letters in a dedicated stream

use crate::bus::{topic_matches, DeadLetter, Delivery, EventBus, PublishAck};
use crate::error::{Error, Result};
use crate::message::OutboundMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// 队列 stream 的键前缀
/// Key prefix for queue streams
const STREAM_PREFIX: &str = "schedq:q:";
/// 绑定表：hash，field 为队列名，value 为绑定模式的 JSON 数组
/// Binding table: hash, field is the queue name, value a JSON array of
/// binding patterns
const BINDINGS_KEY: &str = "schedq:bindings";
/// 延迟消息有序集合，score 为到期毫秒时间戳
/// Delayed message sorted set, scored by maturity in epoch millis
const DELAYED_KEY: &str = "schedq:delayed";
/// 死信 stream
/// Dead-letter stream
const DEAD_STREAM: &str = "schedq:dead";
/// 消费组名
/// Consumer group name
const GROUP: &str = "schedq";
/// stream 长度上限（近似裁剪）
/// Stream length cap (approximate trim)
const STREAM_MAXLEN: usize = 10_000;
/// 一次 forward_due 最多搬运的延迟消息数
/// Max delayed messages moved per forward_due call
const FORWARD_BATCH: isize = 100;
/// 队列为空时两次读取之间的间隔；复用连接上不使用 BLOCK
/// Gap between reads while a queue is empty; BLOCK is not used on the
/// multiplexed connection
const RECEIVE_POLL_SLICE: Duration = Duration::from_millis(50);

fn queue_stream(queue: &str) -> String {
  format!("{STREAM_PREFIX}{queue}")
}

/// 默认消费者名；跨重启稳定，同主机的未确认条目在重启后可被重读
/// Default consumer name; stable across restarts so this host's unacknowledged
/// entries can be re-read after a restart
fn default_consumer() -> String {
  let host = hostname::get()
    .ok()
    .and_then(|h| h.into_string().ok())
    .unwrap_or_else(|| "unknown".to_string());
  format!("schedq-{host}")
}

/// Redis Streams 事件总线
/// Redis Streams event bus
pub struct RedisBus {
  conn: MultiplexedConnection,
  /// 本进程的消费者名
  /// Consumer name of this process
  consumer: String,
  /// 已确认存在消费组的 stream
  /// Streams whose consumer group has been ensured
  groups: Arc<RwLock<HashSet<String>>>,
  /// 已完成崩溃恢复读取的 stream
  /// Streams whose crash recovery read has completed
  recovered: Arc<RwLock<HashSet<String>>>,
}

impl RedisBus {
  /// 连接到单机 Redis
  /// Connect to a standalone Redis
  pub async fn connect(url: &str) -> Result<Self> {
    Self::connect_as(url, default_consumer()).await
  }

  /// 以指定消费者名连接
  /// Connect with an explicit consumer name
  pub async fn connect_as(url: &str, consumer: impl Into<String>) -> Result<Self> {
    let client = redis::Client::open(url)?;
    let conn = client.get_multiplexed_async_connection().await?;
    Ok(Self {
      conn,
      consumer: consumer.into(),
      groups: Arc::new(RwLock::new(HashSet::new())),
      recovered: Arc::new(RwLock::new(HashSet::new())),
    })
  }

  /// 确保 stream 上存在消费组；容忍已存在
  /// Ensure the consumer group exists on the stream; tolerates pre-existing
  async fn ensure_group(&self, stream: &str) -> Result<()> {
    {
      let groups = self.groups.read().await;
      if groups.contains(stream) {
        return Ok(());
      }
    }
    let mut conn = self.conn.clone();
    // 从 "0" 建组，已有条目对消费组可见
    // Group starts at "0" so existing entries are visible to it
    let result: redis::RedisResult<()> = redis::cmd("XGROUP")
      .arg("CREATE")
      .arg(stream)
      .arg(GROUP)
      .arg("0")
      .arg("MKSTREAM")
      .query_async(&mut conn)
      .await;
    if let Err(e) = result {
      if e.code() != Some("BUSYGROUP") {
        return Err(e.into());
      }
    }
    self.groups.write().await.insert(stream.to_string());
    Ok(())
  }

  /// 读取一条消息；id 为 ">" 读新消息，为 "0" 重读本消费者的未确认条目
  /// Read one message; id ">" reads new entries, "0" re-reads this consumer's
  /// unacknowledged ones
  async fn read_one(
    &self,
    stream: &str,
    id: &str,
  ) -> Result<Option<(String, OutboundMessage, Option<String>)>> {
    let mut conn = self.conn.clone();
    let options = StreamReadOptions::default()
      .group(GROUP, &self.consumer)
      .count(1);
    let reply: StreamReadReply = conn.xread_options(&[stream], &[id], &options).await?;
    for key in reply.keys {
      for entry in key.ids {
        let payload = match entry.map.get("message") {
          Some(value) => redis::from_redis_value::<String>(value)?,
          None => {
            return Err(Error::bus(format!(
              "stream entry {} is missing the message field",
              entry.id
            )))
          }
        };
        let message: OutboundMessage = serde_json::from_str(&payload)?;
        let reason = entry
          .map
          .get("reason")
          .and_then(|value| redis::from_redis_value::<String>(value).ok());
        return Ok(Some((entry.id, message, reason)));
      }
    }
    Ok(None)
  }

  /// 先消化崩溃前残留的未确认条目，再读新消息
  /// Drain unacknowledged entries left from a crash before reading new ones
  async fn read_with_recovery(
    &self,
    stream: &str,
  ) -> Result<Option<(String, OutboundMessage, Option<String>)>> {
    let needs_recovery = {
      let recovered = self.recovered.read().await;
      !recovered.contains(stream)
    };
    if needs_recovery {
      if let Some(found) = self.read_one(stream, "0").await? {
        return Ok(Some(found));
      }
      self.recovered.write().await.insert(stream.to_string());
    }
    self.read_one(stream, ">").await
  }

  /// 加载绑定表
  /// Load the binding table
  async fn load_bindings(&self) -> Result<HashMap<String, Vec<String>>> {
    let mut conn = self.conn.clone();
    let raw: HashMap<String, String> = conn.hgetall(BINDINGS_KEY).await?;
    let mut bindings = HashMap::with_capacity(raw.len());
    for (queue, patterns) in raw {
      let patterns: Vec<String> = serde_json::from_str(&patterns)?;
      bindings.insert(queue, patterns);
    }
    Ok(bindings)
  }

  /// 将消息追加到所有绑定匹配的队列 stream，返回命中队列数和首条回执
  /// Append the message to every matching queue stream, returning the hit
  /// count and the first receipt
  async fn route(&self, message: &OutboundMessage) -> Result<(usize, String)> {
    let bindings = self.load_bindings().await?;
    let payload = serde_json::to_string(message)?;
    let mut conn = self.conn.clone();
    let mut routed = 0;
    let mut receipt = String::new();
    for (queue, patterns) in bindings {
      if !patterns
        .iter()
        .any(|pattern| topic_matches(pattern, &message.routing_key))
      {
        continue;
      }
      let id: String = conn
        .xadd_maxlen(
          queue_stream(&queue),
          StreamMaxlen::Approx(STREAM_MAXLEN),
          "*",
          &[("message", payload.as_str())],
        )
        .await?;
      if receipt.is_empty() {
        receipt = id;
      }
      routed += 1;
    }
    Ok((routed, receipt))
  }
}

#[async_trait]
impl EventBus for RedisBus {
  async fn ping(&self) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    // 复用连接随句柄释放关闭
    // The multiplexed connection closes when its handles drop
    Ok(())
  }

  async fn declare_queue(&self, queue: &str, binding_key: &str) -> Result<()> {
    if binding_key.is_empty() {
      return Err(Error::InvalidPattern {
        pattern: binding_key.to_string(),
      });
    }
    let mut conn = self.conn.clone();
    let current: Option<String> = conn.hget(BINDINGS_KEY, queue).await?;
    let mut patterns: Vec<String> = match current {
      Some(raw) => serde_json::from_str(&raw)?,
      None => Vec::new(),
    };
    if !patterns.iter().any(|p| p == binding_key) {
      patterns.push(binding_key.to_string());
      let _: () = conn
        .hset(BINDINGS_KEY, queue, serde_json::to_string(&patterns)?)
        .await?;
    }
    self.ensure_group(&queue_stream(queue)).await
  }

  async fn publish(&self, message: &OutboundMessage) -> Result<PublishAck> {
    let (routed, receipt) = self.route(message).await?;
    Ok(PublishAck {
      message_id: message.message_id,
      receipt,
      routed,
    })
  }

  async fn publish_delayed(&self, message: &OutboundMessage, delay: Duration) -> Result<()> {
    let deliver_at = Utc::now()
      + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
    let member = serde_json::to_string(message)?;
    let mut conn = self.conn.clone();
    let _: () = conn
      .zadd(DELAYED_KEY, member, deliver_at.timestamp_millis())
      .await?;
    Ok(())
  }

  async fn forward_due(&self, now: DateTime<Utc>) -> Result<u64> {
    let mut conn = self.conn.clone();
    let due: Vec<String> = conn
      .zrangebyscore_limit(DELAYED_KEY, "-inf", now.timestamp_millis(), 0, FORWARD_BATCH)
      .await?;

    let mut count = 0;
    for member in due {
      let message: OutboundMessage = serde_json::from_str(&member)?;
      // 先发布后移除：崩溃时宁可重复投递，由确定性消息 ID 去重
      // Publish before remove: a crash duplicates delivery at worst, which the
      // deterministic message ids deduplicate
      self.route(&message).await?;
      let removed: i64 = conn.zrem(DELAYED_KEY, &member).await?;
      if removed > 0 {
        count += 1;
      }
    }
    Ok(count)
  }

  async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
    let stream = queue_stream(queue);
    self.ensure_group(&stream).await?;

    let deadline = tokio::time::Instant::now() + wait;
    loop {
      if let Some((id, message, _)) = self.read_with_recovery(&stream).await? {
        return Ok(Some(Delivery {
          message,
          receipt: id,
          queue: queue.to_string(),
        }));
      }
      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      tokio::time::sleep((deadline - now).min(RECEIVE_POLL_SLICE)).await;
    }
  }

  async fn ack(&self, delivery: &Delivery) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: i64 = conn
      .xack(
        queue_stream(&delivery.queue),
        GROUP,
        &[delivery.receipt.as_str()],
      )
      .await?;
    Ok(())
  }

  async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<()> {
    let payload = serde_json::to_string(&delivery.message)?;
    let mut conn = self.conn.clone();
    let _: String = conn
      .xadd_maxlen(
        DEAD_STREAM,
        StreamMaxlen::Approx(STREAM_MAXLEN),
        "*",
        &[("message", payload.as_str()), ("reason", reason)],
      )
      .await?;
    let _: i64 = conn
      .xack(
        queue_stream(&delivery.queue),
        GROUP,
        &[delivery.receipt.as_str()],
      )
      .await?;
    Ok(())
  }

  async fn receive_dead_letter(&self, wait: Duration) -> Result<Option<DeadLetter>> {
    self.ensure_group(DEAD_STREAM).await?;

    let deadline = tokio::time::Instant::now() + wait;
    loop {
      if let Some((id, message, reason)) = self.read_with_recovery(DEAD_STREAM).await? {
        return Ok(Some(DeadLetter {
          message,
          receipt: id,
          reason: reason.unwrap_or_else(|| "unspecified".to_string()),
        }));
      }
      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      tokio::time::sleep((deadline - now).min(RECEIVE_POLL_SLICE)).await;
    }
  }

  async fn ack_dead_letter(&self, dead: &DeadLetter) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: i64 = conn
      .xack(DEAD_STREAM, GROUP, &[dead.receipt.as_str()])
      .await?;
    Ok(())
  }
}

//! 内存事件总线实现
//! In-memory event bus implementation
//!
//! 使用内存数据结构模拟主题交换机、延迟投递和死信队列，用于测试和嵌入式场景
//! Emulates a topic exchange, delayed delivery and the dead-letter queue with
//! in-memory data structures, for tests and embedded use

use crate::bus::{topic_matches, DeadLetter, Delivery, EventBus, PublishAck};
use crate::error::{Error, Result};
use crate::message::OutboundMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

/// 空队列时两次检查之间的最长间隔
/// Longest gap between two checks while a queue is empty
const RECEIVE_POLL_SLICE: Duration = Duration::from_millis(25);

/// 内存总线行为选项
/// Memory bus behaviour options
#[derive(Debug, Clone, Default)]
pub struct MemoryBusOptions {
  /// 队列中超过此时长未被消费的消息进入死信队列
  /// Messages unconsumed for longer than this move to the dead-letter queue
  pub message_ttl: Option<Duration>,
  /// 投递后超过此时长未确认的消息重新入队
  /// Deliveries unacknowledged for longer than this are re-queued
  pub redeliver_after: Option<Duration>,
}

/// 队列中的一条消息
/// A message sitting in a queue
struct QueuedEntry {
  message: OutboundMessage,
  enqueued_at: DateTime<Utc>,
}

/// 已投递未确认的消息
/// A delivered but unacknowledged message
struct InFlightEntry {
  message: OutboundMessage,
  queue: String,
  reclaim_at: Option<DateTime<Utc>>,
}

/// 延迟消息
/// A delayed message
struct DelayedEntry {
  message: OutboundMessage,
  deliver_at: DateTime<Utc>,
}

/// 死信
/// A dead letter
struct DeadEntry {
  message: OutboundMessage,
  reason: String,
}

/// 总线状态
/// Bus state
#[derive(Default)]
struct BusState {
  /// 队列到绑定模式的映射
  /// Queue to binding pattern mapping
  bindings: HashMap<String, Vec<String>>,
  /// 每个队列的消息
  /// Messages per queue
  queues: HashMap<String, VecDeque<QueuedEntry>>,
  /// 延迟消息，由 forward_due 搬运
  /// Delayed messages, moved by forward_due
  delayed: Vec<DelayedEntry>,
  /// 在途投递，按回执索引
  /// In-flight deliveries, indexed by receipt
  in_flight: HashMap<String, InFlightEntry>,
  /// 死信队列
  /// Dead-letter queue
  dead: VecDeque<DeadEntry>,
  /// 在途死信
  /// In-flight dead letters
  dead_in_flight: HashMap<String, DeadEntry>,
  next_receipt: u64,
  closed: bool,
}

impl BusState {
  fn ensure_open(&self) -> Result<()> {
    if self.closed {
      return Err(Error::bus("memory bus closed"));
    }
    Ok(())
  }

  fn mint_receipt(&mut self) -> String {
    self.next_receipt += 1;
    format!("mem-{}", self.next_receipt)
  }

  /// 将消息路由到所有绑定匹配的队列，返回命中的队列数
  /// Route a message to every queue with a matching binding, returning the
  /// number of queues hit
  fn route(&mut self, message: &OutboundMessage, now: DateTime<Utc>) -> usize {
    let targets: Vec<String> = self
      .bindings
      .iter()
      .filter(|(_, keys)| {
        keys
          .iter()
          .any(|key| topic_matches(key, &message.routing_key))
      })
      .map(|(queue, _)| queue.clone())
      .collect();
    for queue in &targets {
      self
        .queues
        .entry(queue.clone())
        .or_default()
        .push_back(QueuedEntry {
          message: message.clone(),
          enqueued_at: now,
        });
    }
    targets.len()
  }

  /// 将超时未确认的投递放回原队列
  /// Put deliveries that timed out without an ack back on their queues
  fn reclaim_expired(&mut self, now: DateTime<Utc>) {
    let expired: Vec<String> = self
      .in_flight
      .iter()
      .filter(|(_, entry)| entry.reclaim_at.map(|at| at <= now).unwrap_or(false))
      .map(|(receipt, _)| receipt.clone())
      .collect();
    for receipt in expired {
      if let Some(entry) = self.in_flight.remove(&receipt) {
        self
          .queues
          .entry(entry.queue)
          .or_default()
          .push_back(QueuedEntry {
            message: entry.message,
            enqueued_at: now,
          });
      }
    }
  }

  /// 将超过 TTL 的队首消息移入死信队列
  /// Move head-of-queue messages past their TTL into the dead-letter queue
  fn expire_queue(&mut self, queue: &str, ttl: Duration, now: DateTime<Utc>) {
    let ttl = match chrono::Duration::from_std(ttl) {
      Ok(ttl) => ttl,
      Err(_) => return,
    };
    if let Some(entries) = self.queues.get_mut(queue) {
      while let Some(front) = entries.front() {
        if front.enqueued_at + ttl > now {
          break;
        }
        let entry = entries.pop_front().unwrap();
        self.dead.push_back(DeadEntry {
          message: entry.message,
          reason: "message ttl exceeded".to_string(),
        });
      }
    }
  }
}

/// 内存事件总线
/// In-memory event bus
pub struct MemoryBus {
  state: Arc<RwLock<BusState>>,
  options: MemoryBusOptions,
  /// 新消息到达通知
  /// New message arrival notification
  arrivals: Notify,
}

impl Default for MemoryBus {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBus {
  /// 创建新的内存总线
  /// Create a new in-memory bus
  pub fn new() -> Self {
    Self::with_options(MemoryBusOptions::default())
  }

  /// 使用指定选项创建内存总线
  /// Create an in-memory bus with the given options
  pub fn with_options(options: MemoryBusOptions) -> Self {
    Self {
      state: Arc::new(RwLock::new(BusState::default())),
      options,
      arrivals: Notify::new(),
    }
  }

  /// 当前队列深度
  /// Current queue depth
  pub async fn queue_depth(&self, queue: &str) -> usize {
    let state = self.state.read().await;
    state.queues.get(queue).map(|q| q.len()).unwrap_or(0)
  }

  /// 当前死信数量
  /// Current dead letter count
  pub async fn dead_letter_count(&self) -> usize {
    let state = self.state.read().await;
    state.dead.len()
  }

  async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>> {
    let now = Utc::now();
    let mut state = self.state.write().await;
    state.ensure_open()?;
    state.reclaim_expired(now);
    if let Some(ttl) = self.options.message_ttl {
      state.expire_queue(queue, ttl, now);
    }

    let entry = match state.queues.get_mut(queue).and_then(|q| q.pop_front()) {
      Some(entry) => entry,
      None => return Ok(None),
    };
    let receipt = state.mint_receipt();
    let reclaim_at = self
      .options
      .redeliver_after
      .and_then(|d| chrono::Duration::from_std(d).ok())
      .map(|d| now + d);
    state.in_flight.insert(
      receipt.clone(),
      InFlightEntry {
        message: entry.message.clone(),
        queue: queue.to_string(),
        reclaim_at,
      },
    );
    Ok(Some(Delivery {
      message: entry.message,
      receipt,
      queue: queue.to_string(),
    }))
  }

  async fn try_receive_dead(&self) -> Result<Option<DeadLetter>> {
    let mut state = self.state.write().await;
    state.ensure_open()?;
    let entry = match state.dead.pop_front() {
      Some(entry) => entry,
      None => return Ok(None),
    };
    let receipt = state.mint_receipt();
    let dead = DeadLetter {
      message: entry.message.clone(),
      receipt: receipt.clone(),
      reason: entry.reason.clone(),
    };
    state.dead_in_flight.insert(receipt, entry);
    Ok(Some(dead))
  }
}

#[async_trait]
impl EventBus for MemoryBus {
  async fn ping(&self) -> Result<()> {
    let state = self.state.read().await;
    state.ensure_open()
  }

  async fn close(&self) -> Result<()> {
    let mut state = self.state.write().await;
    state.closed = true;
    drop(state);
    self.arrivals.notify_waiters();
    Ok(())
  }

  async fn declare_queue(&self, queue: &str, binding_key: &str) -> Result<()> {
    if binding_key.is_empty() {
      return Err(Error::InvalidPattern {
        pattern: binding_key.to_string(),
      });
    }
    let mut state = self.state.write().await;
    state.ensure_open()?;
    let keys = state.bindings.entry(queue.to_string()).or_default();
    if !keys.iter().any(|k| k == binding_key) {
      keys.push(binding_key.to_string());
    }
    state.queues.entry(queue.to_string()).or_default();
    Ok(())
  }

  async fn publish(&self, message: &OutboundMessage) -> Result<PublishAck> {
    let now = Utc::now();
    let mut state = self.state.write().await;
    state.ensure_open()?;
    let routed = state.route(message, now);
    let receipt = state.mint_receipt();
    drop(state);

    if routed > 0 {
      self.arrivals.notify_waiters();
    }
    Ok(PublishAck {
      message_id: message.message_id,
      receipt,
      routed,
    })
  }

  async fn publish_delayed(&self, message: &OutboundMessage, delay: Duration) -> Result<()> {
    let deliver_at = Utc::now()
      + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
    let mut state = self.state.write().await;
    state.ensure_open()?;
    state.delayed.push(DelayedEntry {
      message: message.clone(),
      deliver_at,
    });
    Ok(())
  }

  async fn forward_due(&self, now: DateTime<Utc>) -> Result<u64> {
    let mut state = self.state.write().await;
    state.ensure_open()?;
    let (due, rest): (Vec<DelayedEntry>, Vec<DelayedEntry>) =
      std::mem::take(&mut state.delayed)
        .into_iter()
        .partition(|entry| entry.deliver_at <= now);
    state.delayed = rest;
    let count = due.len() as u64;
    for entry in due {
      state.route(&entry.message, now);
    }
    drop(state);

    if count > 0 {
      self.arrivals.notify_waiters();
    }
    Ok(count)
  }

  async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
      if let Some(delivery) = self.try_receive(queue).await? {
        return Ok(Some(delivery));
      }
      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      let slice = (deadline - now).min(RECEIVE_POLL_SLICE);
      let _ = tokio::time::timeout(slice, self.arrivals.notified()).await;
    }
  }

  async fn ack(&self, delivery: &Delivery) -> Result<()> {
    let mut state = self.state.write().await;
    match state.in_flight.remove(&delivery.receipt) {
      Some(_) => Ok(()),
      None => Err(Error::bus(format!(
        "unknown delivery receipt: {}",
        delivery.receipt
      ))),
    }
  }

  async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<()> {
    let mut state = self.state.write().await;
    let entry = state.in_flight.remove(&delivery.receipt).ok_or_else(|| {
      Error::bus(format!("unknown delivery receipt: {}", delivery.receipt))
    })?;
    state.dead.push_back(DeadEntry {
      message: entry.message,
      reason: reason.to_string(),
    });
    drop(state);

    self.arrivals.notify_waiters();
    Ok(())
  }

  async fn receive_dead_letter(&self, wait: Duration) -> Result<Option<DeadLetter>> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
      if let Some(dead) = self.try_receive_dead().await? {
        return Ok(Some(dead));
      }
      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      let slice = (deadline - now).min(RECEIVE_POLL_SLICE);
      let _ = tokio::time::timeout(slice, self.arrivals.notified()).await;
    }
  }

  async fn ack_dead_letter(&self, dead: &DeadLetter) -> Result<()> {
    let mut state = self.state.write().await;
    match state.dead_in_flight.remove(&dead.receipt) {
      Some(_) => Ok(()),
      None => Err(Error::bus(format!(
        "unknown dead letter receipt: {}",
        dead.receipt
      ))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use uuid::Uuid;

  fn message(routing_key: &str) -> OutboundMessage {
    OutboundMessage {
      message_id: Uuid::new_v4(),
      routing_key: routing_key.to_string(),
      payload: json!({"kind": "reminder", "entity_ref": "session/1"}),
      attempt_count: 0,
    }
  }

  #[tokio::test]
  async fn test_publish_routes_by_binding() {
    let bus = MemoryBus::new();
    bus.declare_queue("reminders", "global.reminder").await.unwrap();
    bus.declare_queue("everything", "#").await.unwrap();
    bus.declare_queue("followups", "global.followup").await.unwrap();

    let ack = bus.publish(&message("global.reminder")).await.unwrap();
    assert_eq!(ack.routed, 2);
    assert_eq!(bus.queue_depth("reminders").await, 1);
    assert_eq!(bus.queue_depth("everything").await, 1);
    assert_eq!(bus.queue_depth("followups").await, 0);
  }

  #[tokio::test]
  async fn test_unroutable_publish_is_dropped() {
    let bus = MemoryBus::new();
    bus.declare_queue("reminders", "global.reminder").await.unwrap();

    let ack = bus.publish(&message("other.kind")).await.unwrap();
    assert_eq!(ack.routed, 0);
    assert_eq!(bus.queue_depth("reminders").await, 0);
  }

  #[tokio::test]
  async fn test_receive_times_out_on_empty_queue() {
    let bus = MemoryBus::new();
    bus.declare_queue("reminders", "global.reminder").await.unwrap();

    let got = bus
      .receive("reminders", Duration::from_millis(30))
      .await
      .unwrap();
    assert!(got.is_none());
  }

  #[tokio::test]
  async fn test_ack_and_nack_lifecycle() {
    let bus = MemoryBus::new();
    bus.declare_queue("reminders", "global.reminder").await.unwrap();
    bus.publish(&message("global.reminder")).await.unwrap();
    bus.publish(&message("global.reminder")).await.unwrap();

    let first = bus
      .receive("reminders", Duration::from_millis(100))
      .await
      .unwrap()
      .unwrap();
    bus.ack(&first).await.unwrap();
    // 重复确认同一回执是错误
    // Acking the same receipt twice is an error
    assert!(bus.ack(&first).await.is_err());

    let second = bus
      .receive("reminders", Duration::from_millis(100))
      .await
      .unwrap()
      .unwrap();
    bus.nack(&second, "builder rejected payload").await.unwrap();
    assert_eq!(bus.dead_letter_count().await, 1);

    let dead = bus
      .receive_dead_letter(Duration::from_millis(100))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(dead.message.message_id, second.message.message_id);
    assert_eq!(dead.reason, "builder rejected payload");
    bus.ack_dead_letter(&dead).await.unwrap();
    assert!(bus.ack_dead_letter(&dead).await.is_err());
  }

  #[tokio::test]
  async fn test_delayed_messages_wait_for_forward_due() {
    let bus = MemoryBus::new();
    bus.declare_queue("reminders", "global.reminder").await.unwrap();
    let msg = message("global.reminder");
    bus
      .publish_delayed(&msg, Duration::from_secs(30))
      .await
      .unwrap();

    // 未到期：不可见
    // Not matured: invisible
    assert_eq!(bus.forward_due(Utc::now()).await.unwrap(), 0);
    assert_eq!(bus.queue_depth("reminders").await, 0);

    // 到期后被搬运
    // Moved once matured
    let later = Utc::now() + chrono::Duration::seconds(60);
    assert_eq!(bus.forward_due(later).await.unwrap(), 1);
    let got = bus
      .receive("reminders", Duration::from_millis(100))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(got.message.message_id, msg.message_id);
  }

  #[tokio::test]
  async fn test_unacked_delivery_is_redelivered() {
    let bus = MemoryBus::with_options(MemoryBusOptions {
      redeliver_after: Some(Duration::from_millis(40)),
      ..Default::default()
    });
    bus.declare_queue("reminders", "global.reminder").await.unwrap();
    let msg = message("global.reminder");
    bus.publish(&msg).await.unwrap();

    let first = bus
      .receive("reminders", Duration::from_millis(100))
      .await
      .unwrap()
      .unwrap();
    // 不确认，等待回收窗口过去
    // No ack, let the reclaim window pass
    tokio::time::sleep(Duration::from_millis(80)).await;

    let again = bus
      .receive("reminders", Duration::from_millis(200))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(again.message.message_id, first.message.message_id);
  }

  #[tokio::test]
  async fn test_message_ttl_dead_letters_stale_messages() {
    let bus = MemoryBus::with_options(MemoryBusOptions {
      message_ttl: Some(Duration::from_millis(30)),
      ..Default::default()
    });
    bus.declare_queue("reminders", "global.reminder").await.unwrap();
    bus.publish(&message("global.reminder")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let got = bus.receive("reminders", Duration::ZERO).await.unwrap();
    assert!(got.is_none());
    assert_eq!(bus.dead_letter_count().await, 1);
  }

  #[tokio::test]
  async fn test_closed_bus_rejects_operations() {
    let bus = MemoryBus::new();
    bus.declare_queue("reminders", "global.reminder").await.unwrap();
    bus.close().await.unwrap();

    assert!(bus.ping().await.is_err());
    assert!(bus.publish(&message("global.reminder")).await.is_err());
    assert!(bus
      .receive("reminders", Duration::from_millis(10))
      .await
      .is_err());
  }
}

//! 事件总线模块
//! Event bus module
//!
//! 定义了发布调度事件的经纪人抽象：主题路由、延迟投递和死信队列
//! Defines the broker abstraction for publishing schedule events: topic
//! routing, delayed delivery and the dead-letter queue

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::error::Result;
use crate::message::OutboundMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// 发布确认
/// Publish acknowledgement
#[derive(Debug, Clone)]
pub struct PublishAck {
  /// 被确认的消息 ID
  /// The acknowledged message id
  pub message_id: Uuid,
  /// 经纪人侧的回执标识
  /// Broker-side receipt identifier
  pub receipt: String,
  /// 路由到的队列数；0 表示消息被交换机丢弃
  /// Number of queues routed to; 0 means the exchange dropped the message
  pub routed: usize,
}

/// 一次消息投递；通过回执确认或拒绝
/// A single message delivery; acknowledged or rejected via its receipt
#[derive(Debug, Clone)]
pub struct Delivery {
  pub message: OutboundMessage,
  /// 投递回执，ack/nack 时原样传回
  /// Delivery receipt, passed back verbatim on ack/nack
  pub receipt: String,
  /// 消息所在队列
  /// Queue the message was delivered from
  pub queue: String,
}

/// 死信队列中的一条消息
/// A message in the dead-letter queue
#[derive(Debug, Clone)]
pub struct DeadLetter {
  pub message: OutboundMessage,
  pub receipt: String,
  /// 进入死信队列的原因
  /// Reason the message was dead-lettered
  pub reason: String,
}

/// 事件总线接口，定义了与消息经纪人交互的操作
/// Event bus interface defining the operations against the message broker
///
/// 延迟消息不会自行投递，由 `forward_due` 搬运到目标队列
/// Delayed messages do not deliver themselves; `forward_due` moves them to
/// their target queues
#[async_trait]
pub trait EventBus: Send + Sync {
  /// 检查经纪人连通性
  /// Check broker connectivity
  async fn ping(&self) -> Result<()>;

  /// 关闭总线
  /// Close the bus
  async fn close(&self) -> Result<()>;

  /// 声明队列并将其绑定到路由模式；幂等
  /// Declare a queue and bind it to a routing pattern; idempotent
  ///
  /// 绑定模式按 `.` 分段：`*` 匹配一段，`#` 匹配零或多段
  /// Binding patterns split on `.`: `*` matches one segment, `#` matches zero
  /// or more
  async fn declare_queue(&self, queue: &str, binding_key: &str) -> Result<()>;

  /// 按路由键发布消息到所有匹配的队列
  /// Publish a message to every queue whose binding matches its routing key
  async fn publish(&self, message: &OutboundMessage) -> Result<PublishAck>;

  /// 延迟发布；消息在 `delay` 之后才对 `forward_due` 可见
  /// Delayed publish; the message only becomes visible to `forward_due` after
  /// `delay`
  async fn publish_delayed(&self, message: &OutboundMessage, delay: Duration) -> Result<()>;

  /// 将所有已到期的延迟消息转发到目标队列，返回转发数量
  /// Forward all matured delayed messages to their target queues, returning
  /// the count forwarded
  async fn forward_due(&self, now: DateTime<Utc>) -> Result<u64>;

  /// 从队列取一条消息，最多等待 `wait`；无消息返回 None
  /// Take one message from the queue, waiting at most `wait`; None when empty
  async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

  /// 确认投递
  /// Acknowledge a delivery
  async fn ack(&self, delivery: &Delivery) -> Result<()>;

  /// 拒绝投递并将消息送入死信队列
  /// Reject a delivery and route the message to the dead-letter queue
  async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<()>;

  /// 从死信队列取一条消息，最多等待 `wait`
  /// Take one message from the dead-letter queue, waiting at most `wait`
  async fn receive_dead_letter(&self, wait: Duration) -> Result<Option<DeadLetter>>;

  /// 确认死信已被处理
  /// Acknowledge that a dead letter has been handled
  async fn ack_dead_letter(&self, dead: &DeadLetter) -> Result<()>;
}

/// 判断路由键是否匹配绑定模式
/// Check whether a routing key matches a binding pattern
///
/// 模式按 `.` 分段；`*` 匹配恰好一段，`#` 匹配零或多段
/// Patterns split on `.`; `*` matches exactly one segment, `#` matches zero or
/// more segments
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
  let pattern: Vec<&str> = pattern.split('.').collect();
  let key: Vec<&str> = routing_key.split('.').collect();
  match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
  match pattern.first() {
    None => key.is_empty(),
    Some(&"#") => {
      if match_segments(&pattern[1..], key) {
        return true;
      }
      !key.is_empty() && match_segments(pattern, &key[1..])
    }
    Some(&segment) => match key.first() {
      Some(&head) if segment == "*" || segment == head => {
        match_segments(&pattern[1..], &key[1..])
      }
      _ => false,
    },
  }
}

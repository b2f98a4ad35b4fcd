//! 事件发布器
//! Event publisher
//!
//! 在总线之上加上作用域路由、单次发布超时和有界重连退避
//! Adds scope routing, per-attempt timeouts and bounded reconnect backoff on
//! top of the bus

use crate::bus::{EventBus, PublishAck};
use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::item::ScheduleItem;
use crate::message::OutboundMessage;
use std::sync::Arc;
use tracing::{debug, warn};

/// 事件发布器
/// Event publisher
pub struct Publisher {
  bus: Arc<dyn EventBus>,
  config: PublisherConfig,
}

impl Publisher {
  /// 创建新的发布器
  /// Create a new publisher
  pub fn new(bus: Arc<dyn EventBus>, config: PublisherConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self { bus, config })
  }

  /// 当前租户作用域
  /// Current tenant scope
  pub fn scope(&self) -> &str {
    &self.config.scope
  }

  /// 用发布器的作用域为调度项构造信封消息
  /// Build an envelope message for a schedule item under this publisher's
  /// scope
  pub fn message_for(&self, item: &ScheduleItem, data: serde_json::Value) -> OutboundMessage {
    OutboundMessage::envelope(item, &self.config.scope, data)
  }

  /// 发布一条消息；瞬时失败按重连退避重试，重试耗尽后返回最后一个错误
  /// Publish a message; transient failures retry under the reconnect backoff,
  /// and the last error is returned once retries run out
  pub async fn publish(&self, message: &OutboundMessage) -> Result<PublishAck> {
    let backoff = &self.config.reconnect_backoff;
    let mut attempt: u32 = 0;
    loop {
      let outcome =
        tokio::time::timeout(self.config.publish_timeout, self.bus.publish(message)).await;
      let err = match outcome {
        Ok(Ok(ack)) => {
          if ack.routed == 0 {
            warn!(
              "Publisher: message {} with routing key {} matched no queue",
              ack.message_id, message.routing_key
            );
          }
          return Ok(ack);
        }
        Ok(Err(e)) => e,
        Err(_) => Error::Timeout,
      };

      if !err.is_retriable() || !backoff.has_next(attempt) {
        return Err(err);
      }
      let delay = backoff.delay_for(attempt);
      attempt += 1;
      debug!(
        "Publisher: publish attempt {} for message {} failed, retrying in {:?}: {}",
        attempt, message.message_id, delay, err
      );
      tokio::time::sleep(delay).await;
    }
  }
}

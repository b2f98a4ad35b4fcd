//! Retrier 模块
//! Retrier module
//!
//! 消费死信队列：未到尝试上限的消息按指数退避延迟重投，
//! 到达上限的消息写入终态失败审计后确认丢弃
//! Consumes the dead letter queue: messages under the attempt cap are
//! redelivered with exponential backoff, messages at the cap get a terminal
//! failure audit record and are acked away
//!
//! 同一个循环也负责把到期的延迟消息搬回目标队列
//! The same loop also moves due delayed messages back to their target queues

use crate::audit::AuditSink;
use crate::bus::{DeadLetter, EventBus};
use crate::config::RetrierConfig;
use crate::error::Result;
use crate::message::TerminalFailure;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::ComponentLifecycle;

/// Retrier - 负责重投失败消息并记录终态失败
/// Retrier - responsible for redelivering failed messages and recording
/// terminal failures
pub struct Retrier {
  bus: Arc<dyn EventBus>,
  audit: Arc<dyn AuditSink>,
  config: RetrierConfig,
  done: Arc<AtomicBool>,
}

impl Retrier {
  /// 创建新的 Retrier
  /// Create a new Retrier
  pub fn new(bus: Arc<dyn EventBus>, audit: Arc<dyn AuditSink>, config: RetrierConfig) -> Self {
    Self {
      bus,
      audit,
      config,
      done: Arc::new(AtomicBool::new(false)),
    }
  }

  /// 启动 Retrier
  /// Start the Retrier
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        if self.done.load(Ordering::Relaxed) {
          debug!("Retrier: shutting down");
          break;
        }

        // 到期的延迟消息先回到队列
        // Due delayed messages go back to their queues first
        if let Err(e) = self.bus.forward_due(Utc::now()).await {
          warn!("Retrier: failed to forward due messages: {}", e);
        }

        // 死信读取本身就是节流：无死信时最多阻塞 receive_wait
        // The dead letter read is its own throttle: with nothing dead it blocks
        // up to receive_wait
        match self.bus.receive_dead_letter(self.config.receive_wait).await {
          Ok(Some(dead)) => {
            if let Err(e) = self.handle_dead_letter(dead).await {
              error!("Retrier: failed to handle dead letter: {}", e);
            }
          }
          Ok(None) => {}
          Err(e) => {
            warn!("Retrier: failed to receive dead letter: {}", e);
            tokio::time::sleep(self.config.receive_wait).await;
          }
        }
      }
    })
  }

  /// 处理一条死信：重投或写入审计
  /// Handle one dead letter: redeliver or write the audit record
  ///
  /// 审计写入失败时死信不确认，下一轮重新处理
  /// When the audit write fails the dead letter stays unacked and is handled
  /// again next round
  async fn handle_dead_letter(&self, dead: DeadLetter) -> Result<()> {
    let message = &dead.message;

    if message.attempt_count + 1 >= self.config.max_attempts {
      let failure = TerminalFailure::for_message(message, dead.reason.clone());
      self.audit.record(&failure).await?;
      self.bus.ack_dead_letter(&dead).await?;
      warn!(
        "Retrier: message {} exhausted its attempts, terminal failure recorded: {}",
        message.message_id, dead.reason
      );
      return Ok(());
    }

    let delay = self.config.backoff.delay_for(message.attempt_count);
    let retry = message.next_attempt();
    self.bus.publish_delayed(&retry, delay).await?;
    self.bus.ack_dead_letter(&dead).await?;
    debug!(
      "Retrier: message {} redelivering in {:?} (attempt {})",
      retry.message_id, delay, retry.attempt_count
    );
    Ok(())
  }

  /// 停止 Retrier
  /// Stop the Retrier
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for Retrier {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Retrier::start(self)
  }

  fn shutdown(&self) {
    Retrier::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Retrier::is_done(self)
  }
}

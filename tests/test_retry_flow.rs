//! 重试与死信流程集成测试
//! Retry and dead letter flow integration tests
//!
//! 消费者拒绝的消息经由死信队列回到 Retrier，按退避重投；
//! 尝试耗尽后只留下一条终态失败审计记录
//! Messages a consumer rejects travel through the dead letter queue back to
//! the Retrier and are redelivered under backoff; once attempts run out, a
//! single terminal failure audit record remains

use chrono::Utc;
use schedq::audit::{AuditSink, MemoryAuditSink};
use schedq::bus::memory::MemoryBus;
use schedq::bus::EventBus;
use schedq::components::Retrier;
use schedq::config::{BackoffPolicy, RetrierConfig};
use schedq::item::{ScheduleItem, ScheduleState};
use schedq::message::OutboundMessage;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const QUEUE: &str = "session-events";

fn sample_message(entity_ref: &str) -> OutboundMessage {
  let now = Utc::now();
  let item = ScheduleItem {
    id: Uuid::new_v4(),
    kind: "reminder".to_string(),
    entity_ref: entity_ref.to_string(),
    due_at: now,
    state: ScheduleState::Pending,
    claimed_at: None,
    claimed_by: None,
    payload: serde_json::json!({"text": "ping"}),
    failure_reason: None,
    created_at: now,
    updated_at: now,
  };
  OutboundMessage::envelope(&item, "global", item.payload.clone())
}

fn fast_retrier_config(max_attempts: u32) -> RetrierConfig {
  RetrierConfig::default()
    .max_attempts(max_attempts)
    .backoff(
      BackoffPolicy::new(
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(80),
        max_attempts,
      )
      .with_jitter(false),
    )
    .receive_wait(Duration::from_millis(20))
}

async fn rig(max_attempts: u32) -> (Arc<MemoryBus>, Arc<MemoryAuditSink>, Arc<Retrier>) {
  let bus = Arc::new(MemoryBus::new());
  bus.declare_queue(QUEUE, "global.#").await.unwrap();
  let audit = Arc::new(MemoryAuditSink::new());
  let retrier = Arc::new(Retrier::new(
    bus.clone() as Arc<dyn EventBus>,
    audit.clone() as Arc<dyn AuditSink>,
    fast_retrier_config(max_attempts),
  ));
  (bus, audit, retrier)
}

/// 消费者失败两次后恢复：消息第三次投递成功，无审计记录
/// The consumer fails twice then recovers: the third delivery succeeds and
/// nothing is audited
#[tokio::test]
async fn test_message_retries_until_consumer_recovers() {
  let (bus, audit, retrier) = rig(5).await;
  let handle = retrier.clone().start();

  let message = sample_message("session/50");
  bus.publish(&message).await.unwrap();

  let mut rejections = 0;
  let mut final_attempt = None;
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while tokio::time::Instant::now() < deadline {
    let Some(delivery) = bus.receive(QUEUE, Duration::from_millis(300)).await.unwrap() else {
      continue;
    };
    if rejections < 2 {
      rejections += 1;
      bus.nack(&delivery, "transient handler error").await.unwrap();
    } else {
      final_attempt = Some(delivery.message.attempt_count);
      bus.ack(&delivery).await.unwrap();
      break;
    }
  }

  // 第三次投递（两次重投之后）成功
  // The third delivery (after two redeliveries) succeeds
  assert_eq!(final_attempt, Some(2));
  assert!(audit.is_empty().await);
  assert_eq!(bus.dead_letter_count().await, 0);

  retrier.shutdown();
  handle.await.unwrap();
}

/// 消费者一直失败：死信队列最终排空成恰好一条审计记录
/// The consumer keeps failing: the dead letter queue drains to exactly one
/// audit record
#[tokio::test]
async fn test_exhausted_message_lands_in_audit_once() {
  let (bus, audit, retrier) = rig(3).await;
  let handle = retrier.clone().start();

  let message = sample_message("session/51");
  bus.publish(&message).await.unwrap();

  // 投递 0、1、2 各拒绝一次，之后总线安静
  // Deliveries 0, 1, and 2 are each rejected, then the bus goes quiet
  let mut deliveries = 0;
  while let Some(delivery) = bus.receive(QUEUE, Duration::from_millis(500)).await.unwrap() {
    assert_eq!(delivery.message.attempt_count, deliveries);
    deliveries += 1;
    bus.nack(&delivery, "schema mismatch").await.unwrap();
  }
  assert_eq!(deliveries, 3);

  // 审计记录恰好一条，死信队列排空
  // Exactly one audit record, the dead letter queue is drained
  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  let failure = loop {
    if let Some(failure) = audit.find(message.message_id).await {
      break failure;
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "terminal failure never recorded"
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  };
  assert_eq!(failure.failure_reason, "schema mismatch");
  assert_eq!(failure.attempt_count, 2);
  assert_eq!(failure.entity_ref, "session/51");
  assert_eq!(audit.len().await, 1);
  assert_eq!(bus.dead_letter_count().await, 0);

  retrier.shutdown();
  handle.await.unwrap();
}

/// 多条消息独立走完退避：每条各有一条审计记录
/// Several messages run through backoff independently, one audit record each
#[tokio::test]
async fn test_exhaustion_is_per_message() {
  let (bus, audit, retrier) = rig(2).await;
  let handle = retrier.clone().start();

  let one = sample_message("session/52");
  let two = sample_message("session/53");
  bus.publish(&one).await.unwrap();
  bus.publish(&two).await.unwrap();

  // 全部拒绝：每条消息投递 0、1 两次
  // Reject everything: each message is delivered at attempts 0 and 1
  let mut deliveries = 0;
  while let Some(delivery) = bus.receive(QUEUE, Duration::from_millis(500)).await.unwrap() {
    deliveries += 1;
    bus.nack(&delivery, "consumer offline").await.unwrap();
  }
  assert_eq!(deliveries, 4);

  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  loop {
    if audit.len().await == 2 {
      break;
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "both terminal failures should be recorded"
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(audit.find(one.message_id).await.is_some());
  assert!(audit.find(two.message_id).await.is_some());

  retrier.shutdown();
  handle.await.unwrap();
}

//! RedisBus 实例集成测试
//! RedisBus live-instance integration tests
//!
//! 需要可用的 Redis；用 `cargo test -- --ignored` 运行
//! Requires a reachable Redis; run with `cargo test -- --ignored`

#![cfg(feature = "redis")]

use chrono::Utc;
use schedq::bus::redis::RedisBus;
use schedq::bus::EventBus;
use schedq::item::{ScheduleItem, ScheduleState};
use schedq::message::OutboundMessage;
use std::time::Duration;
use uuid::Uuid;

// 测试默认 Redis 地址，可用 REDIS_URL 覆盖
// Default test Redis url, override with REDIS_URL
const TEST_REDIS_URL: &str = "redis://localhost:6379";

fn redis_url() -> String {
  std::env::var("REDIS_URL").unwrap_or_else(|_| TEST_REDIS_URL.to_string())
}

// 队列名带随机后缀，避免跨运行互相消费
// Queue names carry a random suffix so runs do not consume each other
fn unique_queue() -> String {
  format!("live-events-{}", Uuid::new_v4().simple())
}

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
    payload: serde_json::json!({"text": "live ping"}),
    failure_reason: None,
    created_at: now,
    updated_at: now,
  };
  OutboundMessage::envelope(&item, "global", item.payload.clone())
}

#[tokio::test]
#[ignore] // Requires Redis to be running
async fn test_redis_bus_publish_receive_ack() {
  let bus = RedisBus::connect(&redis_url()).await.unwrap();
  let queue = unique_queue();
  bus.declare_queue(&queue, "global.reminder").await.unwrap();

  let message = sample_message("session/live-10");
  // 绑定表跨运行共享，历史队列也可能被路由到
  // The binding table is shared across runs, stale queues may be routed too
  let ack = bus.publish(&message).await.unwrap();
  assert!(ack.routed >= 1);

  let delivery = bus
    .receive(&queue, Duration::from_secs(2))
    .await
    .unwrap()
    .expect("delivery from stream");
  assert_eq!(delivery.message.message_id, message.message_id);
  assert_eq!(delivery.queue, queue);
  bus.ack(&delivery).await.unwrap();

  // 确认后流里不再有待处理消息
  // After the ack the stream has nothing pending
  assert!(bus
    .receive(&queue, Duration::from_millis(300))
    .await
    .unwrap()
    .is_none());

  bus.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis to be running
async fn test_redis_bus_delayed_forwarding() {
  let bus = RedisBus::connect(&redis_url()).await.unwrap();
  let queue = unique_queue();
  bus.declare_queue(&queue, "global.#").await.unwrap();

  let message = sample_message("session/live-11");
  bus
    .publish_delayed(&message, Duration::from_millis(50))
    .await
    .unwrap();

  // 到期前我们的消息不会出现在队列里（延迟集合跨运行共享，
  // 历史残留可能同时被转发，忽略并确认掉即可）
  // Before the due time our message never shows up in the queue (the delayed
  // set is shared across runs, stale leftovers may forward too; ack them away)
  bus.forward_due(Utc::now()).await.unwrap();
  if let Some(stray) = bus
    .receive(&queue, Duration::from_millis(150))
    .await
    .unwrap()
  {
    assert_ne!(stray.message.message_id, message.message_id);
    bus.ack(&stray).await.unwrap();
  }

  tokio::time::sleep(Duration::from_millis(80)).await;
  let forwarded = bus.forward_due(Utc::now()).await.unwrap();
  assert!(forwarded >= 1);

  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  loop {
    let delivery = bus
      .receive(&queue, Duration::from_millis(300))
      .await
      .unwrap()
      .expect("forwarded delivery");
    bus.ack(&delivery).await.unwrap();
    if delivery.message.message_id == message.message_id {
      break;
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "our delayed message never arrived"
    );
  }

  bus.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis to be running
async fn test_redis_bus_nack_to_dead_letter() {
  let bus = RedisBus::connect(&redis_url()).await.unwrap();
  let queue = unique_queue();
  bus.declare_queue(&queue, "global.reminder").await.unwrap();

  let message = sample_message("session/live-12");
  bus.publish(&message).await.unwrap();

  let delivery = bus
    .receive(&queue, Duration::from_secs(2))
    .await
    .unwrap()
    .expect("delivery");
  bus.nack(&delivery, "live consumer rejected").await.unwrap();

  // 死信带着拒绝原因回来；死信流跨运行共享，跳过并确认历史残留
  // The dead letter comes back carrying the rejection reason; the dead stream
  // is shared across runs, so stray leftovers are acked past
  let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
  let dead = loop {
    let candidate = bus
      .receive_dead_letter(Duration::from_millis(300))
      .await
      .unwrap();
    match candidate {
      Some(dead) if dead.message.message_id == message.message_id => break dead,
      Some(stray) => bus.ack_dead_letter(&stray).await.unwrap(),
      None => {}
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "our dead letter never arrived"
    );
  };
  assert_eq!(dead.reason, "live consumer rejected");
  bus.ack_dead_letter(&dead).await.unwrap();

  bus.close().await.unwrap();
}

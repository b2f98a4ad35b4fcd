//! Dispatcher 模块
//! Dispatcher module
//!
//! 每个调度类别一个 Dispatcher，负责认领到期的调度项、构建事件并发布
//! One Dispatcher per schedule kind, responsible for claiming due items,
//! building events, and publishing them
//!
//! 事件循环由三种信号驱动：存储的唤醒推送、到期时刻的定时睡眠、兜底轮询。
//! 三者汇合在同一个 `select!` 上；其他类别的唤醒不会打断睡眠。
//! The event loop is driven by three signals: wake pushes from the store, a
//! timed sleep until the next due instant, and the safety-net poll. All three
//! converge on one `select!`; wakes for other kinds leave the sleep in place.

use crate::builder::EventBuilder;
use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::item::ScheduleItem;
use crate::publisher::Publisher;
use crate::store::{ScheduleStore, WakeStream};
use chrono::Utc;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ComponentLifecycle;

/// 睡眠下限，防止认领失败时空转
/// Sleep floor, prevents spinning when claims fail
const MIN_SLEEP: Duration = Duration::from_millis(50);

/// 发布失败滞留项的重试节奏
/// Retry pace for items held back by publish failures
const CARRY_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Dispatcher - 单一类别的调度守护进程
/// Dispatcher - the scheduling daemon for a single kind
///
/// 到期项被认领后交给构建器产出消息，再经发布器送上总线：
/// 构建失败是永久性的（数据问题），调度项标记 FAILED；
/// 发布失败是瞬时性的，项留在本地滞留区，下一轮重试。
/// Claimed items go through the builder to produce a message, then out on the
/// bus via the publisher: build failures are permanent (a data problem) and
/// mark the item FAILED; publish failures are transient and the item is held
/// back locally for the next round.
pub struct Dispatcher {
  store: Arc<dyn ScheduleStore>,
  publisher: Arc<Publisher>,
  builder: Arc<dyn EventBuilder>,
  kind: String,
  config: DispatcherConfig,
  done: Arc<AtomicBool>,
  nudge: Notify,
  carry: Mutex<Vec<ScheduleItem>>,
}

impl Dispatcher {
  /// 创建新的 Dispatcher
  /// Create a new Dispatcher
  pub fn new(
    store: Arc<dyn ScheduleStore>,
    publisher: Arc<Publisher>,
    builder: Arc<dyn EventBuilder>,
    kind: impl Into<String>,
    config: DispatcherConfig,
  ) -> Self {
    Self {
      store,
      publisher,
      builder,
      kind: kind.into(),
      config,
      done: Arc::new(AtomicBool::new(false)),
      nudge: Notify::new(),
      carry: Mutex::new(Vec::new()),
    }
  }

  /// 此 Dispatcher 负责的调度类别
  /// The schedule kind this Dispatcher serves
  pub fn kind(&self) -> &str {
    &self.kind
  }

  /// 启动 Dispatcher
  /// Start the Dispatcher
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      self.run().await;
    })
  }

  /// 停止 Dispatcher
  /// Stop the Dispatcher
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
    self.nudge.notify_one();
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }

  /// 事件循环：认领一轮，睡到下一个到期时刻或被唤醒
  /// Event loop: claim a round, then sleep until the next due instant or a wake
  async fn run(&self) {
    info!("Dispatcher: starting for kind {}", self.kind);
    let mut wake = self.subscribe_or_pending().await;

    loop {
      if self.done.load(Ordering::Relaxed) {
        debug!("Dispatcher: shutting down for kind {}", self.kind);
        break;
      }

      // 启动时先补课：进程下线期间累积的到期项立即处理
      // Catch up first: items that came due while the process was down are
      // handled immediately
      self.drain_due().await;

      let deadline = tokio::time::Instant::now() + self.next_sleep().await;
      loop {
        tokio::select! {
          _ = tokio::time::sleep_until(deadline) => break,
          _ = self.nudge.notified() => break,
          signal = wake.next() => match signal {
            Some(Ok(signal)) => {
              if signal.concerns(&self.kind) {
                debug!("Dispatcher: woken for kind {}", self.kind);
                break;
              }
              // 其他类别的唤醒不触发认领，继续睡到原定时刻
              // A wake for another kind claims nothing, keep sleeping toward
              // the same deadline
            }
            Some(Err(e)) => {
              // 流出错可能吞掉了信号，立即补一轮认领
              // A stream error may have swallowed a signal, run a catch-up
              // round right away
              warn!("Dispatcher: wake stream error for kind {}: {}", self.kind, e);
              break;
            }
            None => {
              warn!(
                "Dispatcher: wake stream ended for kind {}, resubscribing",
                self.kind
              );
              wake = self.subscribe_or_pending().await;
              break;
            }
          },
        }
      }
    }
  }

  /// 认领并发布，直到没有到期项
  /// Claim and publish until nothing is due
  async fn drain_due(&self) {
    loop {
      if self.done.load(Ordering::Relaxed) {
        break;
      }
      match self.dispatch_batch().await {
        Ok(0) => break,
        Ok(count) => debug!("Dispatcher: published {} {} event(s)", count, self.kind),
        Err(e) => {
          error!("Dispatcher: cycle failed for kind {}: {}", self.kind, e);
          break;
        }
      }
    }
  }

  /// 处理一批：滞留项优先，然后是新认领的到期项
  /// Process one batch: held-back items first, then freshly claimed due items
  async fn dispatch_batch(&self) -> Result<usize> {
    let claimed = self
      .store
      .claim_due(&self.kind, Utc::now(), self.config.batch_limit)
      .await?;

    let mut items: Vec<ScheduleItem> = {
      let mut carry = self.carry.lock().await;
      carry.drain(..).collect()
    };
    items.extend(claimed);
    if items.is_empty() {
      return Ok(0);
    }

    let mut processed: Vec<Uuid> = Vec::new();
    let mut held_back: Vec<ScheduleItem> = Vec::new();

    for item in items {
      let message = match self.builder.build(&item) {
        Ok(message) => message,
        Err(e) => {
          error!(
            "Dispatcher: builder rejected item {} of kind {}: {}",
            item.id, self.kind, e
          );
          if let Err(mark_err) = self.store.mark_failed(item.id, &e.to_string()).await {
            error!(
              "Dispatcher: failed to mark item {} failed: {}",
              item.id, mark_err
            );
          }
          continue;
        }
      };

      match self.publisher.publish(&message).await {
        Ok(_) => processed.push(item.id),
        Err(e) => {
          warn!(
            "Dispatcher: publish failed for item {} of kind {}, holding back: {}",
            item.id, self.kind, e
          );
          held_back.push(item);
        }
      }
    }

    let published = processed.len();
    // 滞留项先入队再标记完成，标记失败也不会丢滞留项
    // Held-back items are stashed before marking, so a marking failure cannot
    // lose them
    if !held_back.is_empty() {
      self.carry.lock().await.extend(held_back);
    }
    if !processed.is_empty() {
      self.store.mark_processed(&processed).await?;
    }
    Ok(published)
  }

  /// 睡到下一个到期时刻，上限是兜底轮询间隔
  /// Sleep until the next due instant, capped at the safety-net poll interval
  async fn next_sleep(&self) -> Duration {
    let mut sleep_dur = match self.store.earliest_pending_due(&self.kind).await {
      Ok(Some(due_at)) => {
        let until = (due_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        until.min(self.config.poll_interval)
      }
      Ok(None) => self.config.poll_interval,
      Err(e) => {
        warn!(
          "Dispatcher: failed to read next due time for kind {}: {}",
          self.kind, e
        );
        self.config.poll_interval
      }
    };

    if !self.carry.lock().await.is_empty() {
      sleep_dur = sleep_dur.min(CARRY_RETRY_PAUSE);
    }
    sleep_dur.max(MIN_SLEEP)
  }

  /// 订阅唤醒信号；订阅反复失败时退化为纯轮询
  /// Subscribe to wake signals; after repeated failures degrade to pure polling
  async fn subscribe_or_pending(&self) -> WakeStream {
    let backoff = &self.config.resubscribe_backoff;
    let mut attempt: u32 = 0;
    loop {
      if self.done.load(Ordering::Relaxed) {
        return Box::new(stream::pending());
      }
      match self.store.subscribe_wake().await {
        Ok(wake) => {
          debug!(
            "Dispatcher: wake subscription established for kind {}",
            self.kind
          );
          return wake;
        }
        Err(e) if backoff.has_next(attempt) => {
          let delay = backoff.delay_for(attempt);
          attempt += 1;
          warn!(
            "Dispatcher: wake subscription failed for kind {}, retrying in {:?}: {}",
            self.kind, delay, e
          );
          tokio::time::sleep(delay).await;
        }
        Err(e) => {
          // 没有订阅也能工作，poll_interval 仍然兜底
          // The loop still works without a subscription, poll_interval covers it
          error!(
            "Dispatcher: wake subscription unavailable for kind {}: {}",
            self.kind, e
          );
          return Box::new(stream::pending());
        }
      }
    }
  }
}

impl ComponentLifecycle for Dispatcher {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Dispatcher::start(self)
  }

  fn shutdown(&self) {
    Dispatcher::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Dispatcher::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::BuilderFunc;
  use crate::bus::memory::MemoryBus;
  use crate::bus::EventBus;
  use crate::config::PublisherConfig;
  use crate::error::Error;
  use crate::item::{NewScheduleItem, ScheduleState};
  use crate::message::OutboundMessage;
  use crate::store::memory::MemoryStore;

  fn echo_builder() -> Arc<dyn EventBuilder> {
    Arc::new(BuilderFunc(|item: &ScheduleItem| {
      Ok(OutboundMessage::envelope(item, "global", item.payload.clone()))
    }))
  }

  async fn test_rig() -> (Arc<MemoryStore>, Arc<MemoryBus>, Arc<Publisher>) {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(MemoryBus::new());
    bus
      .declare_queue("events", "global.#")
      .await
      .expect("declare queue");
    let publisher = Arc::new(
      Publisher::new(bus.clone() as Arc<dyn EventBus>, PublisherConfig::default())
        .expect("publisher"),
    );
    (store, bus, publisher)
  }

  fn fast_config() -> DispatcherConfig {
    DispatcherConfig::default().poll_interval(Duration::from_secs(30))
  }

  #[tokio::test]
  async fn test_dispatcher_shutdown() {
    let (store, _bus, publisher) = test_rig().await;
    let dispatcher = Dispatcher::new(store, publisher, echo_builder(), "reminder", fast_config());

    assert!(!dispatcher.is_done());
    dispatcher.shutdown();
    assert!(dispatcher.is_done());
  }

  #[tokio::test]
  async fn test_dispatcher_publishes_due_items() {
    let (store, bus, publisher) = test_rig().await;
    let item = store
      .insert(
        NewScheduleItem::new("reminder", "session/1", Utc::now())
          .payload(serde_json::json!({"text": "hi"})),
      )
      .await
      .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
      store.clone(),
      publisher,
      echo_builder(),
      "reminder",
      fast_config(),
    ));
    let handle = dispatcher.clone().start();

    let delivery = bus
      .receive("events", Duration::from_secs(2))
      .await
      .unwrap()
      .expect("event delivered");
    assert_eq!(delivery.message.routing_key, "global.reminder");
    bus.ack(&delivery).await.unwrap();

    let stored = store.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.state, ScheduleState::Processed);

    dispatcher.shutdown();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_dispatcher_marks_build_failures() {
    let (store, bus, publisher) = test_rig().await;
    let builder: Arc<dyn EventBuilder> = Arc::new(BuilderFunc(|item: &ScheduleItem| {
      Err(Error::builder(&item.kind, "payload missing text"))
    }));
    let item = store
      .insert(NewScheduleItem::new("reminder", "session/2", Utc::now()))
      .await
      .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
      store.clone(),
      publisher,
      builder,
      "reminder",
      fast_config(),
    ));
    let handle = dispatcher.clone().start();

    // 构建失败的项进入 FAILED，不会发布任何消息
    // A build failure moves the item to FAILED and nothing is published
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
      let stored = store.get(item.id).await.unwrap().unwrap();
      if stored.state == ScheduleState::Failed {
        assert!(stored
          .failure_reason
          .as_deref()
          .unwrap_or_default()
          .contains("payload missing text"));
        break;
      }
      assert!(
        tokio::time::Instant::now() < deadline,
        "item never marked failed"
      );
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(bus.queue_depth("events").await, 0);

    dispatcher.shutdown();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_dispatcher_wakes_on_insert() {
    let (store, bus, publisher) = test_rig().await;
    let dispatcher = Arc::new(Dispatcher::new(
      store.clone(),
      publisher,
      echo_builder(),
      "reminder",
      fast_config(),
    ));
    let handle = dispatcher.clone().start();

    // 等循环进入睡眠后再插入，验证推送路径而不是轮询
    // Insert after the loop has gone to sleep, exercising the push path rather
    // than the poll
    tokio::time::sleep(Duration::from_millis(150)).await;
    store
      .insert(NewScheduleItem::new("reminder", "session/3", Utc::now()))
      .await
      .unwrap();

    let delivery = bus
      .receive("events", Duration::from_secs(2))
      .await
      .unwrap()
      .expect("wake should trigger a prompt claim");
    bus.ack(&delivery).await.unwrap();

    dispatcher.shutdown();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_dispatcher_skips_future_items() {
    let (store, bus, publisher) = test_rig().await;
    store
      .insert(NewScheduleItem::new(
        "reminder",
        "session/4",
        Utc::now() + chrono::Duration::seconds(120),
      ))
      .await
      .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
      store.clone(),
      publisher,
      echo_builder(),
      "reminder",
      fast_config(),
    ));
    let handle = dispatcher.clone().start();

    let delivery = bus.receive("events", Duration::from_millis(300)).await.unwrap();
    assert!(delivery.is_none(), "future item must not be published early");

    dispatcher.shutdown();
    handle.await.unwrap();
  }
}

//! Run Event Bus
//!
//! Per-run fan-out to any number of subscribers. Publishing never blocks the
//! runner: each subscriber owns a bounded queue, the oldest pending events are
//! dropped when it falls behind, and a `dropped` marker reports the gap.
//! Terminal events are replayed to late subscribers for a grace period, after
//! which the run's channel is garbage-collected.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

use crate::config::EventBusConfig;
use crate::reward::JudgeInfo;

/// Round for event serialization; stored rows keep full precision.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub outcome: f64,
    pub process: f64,
    pub cost_penalty: f64,
}

/// The closed event set observers may receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    IterSelected { i: u32, operator: String },
    IterGenStart { i: u32 },
    IterGenDone { i: u32, duration_ms: u64, prompt_length: usize },
    IterScoreStart { i: u32 },
    IterScoreDone {
        i: u32,
        total_reward: f64,
        reward_breakdown: RewardBreakdown,
        judge_info: JudgeInfo,
    },
    IterSaved { i: u32, variant_id: i64 },
    IterError { i: u32, reason: String },
    Judge { i: u32, models: Vec<String>, tie_breaker_used: bool },
    Done { status: String, #[serde(skip_serializing_if = "Option::is_none")] reason: Option<String> },
    Error { message: String },
    KeepAlive,
    Dropped { n: u64 },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Done { .. } | RunEvent::Error { .. })
    }
}

struct SubscriberQueue {
    events: VecDeque<RunEvent>,
    dropped_pending: u64,
    closed: bool,
}

struct SubscriberState {
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

struct RunChannel {
    subscribers: Mutex<Vec<Arc<SubscriberState>>>,
    terminal: Mutex<Vec<RunEvent>>,
    is_terminal: AtomicBool,
}

impl RunChannel {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            terminal: Mutex::new(Vec::new()),
            is_terminal: AtomicBool::new(false),
        }
    }
}

/// A live subscription to one run's events.
pub struct Subscription {
    state: Arc<SubscriberState>,
    keep_alive: std::time::Duration,
}

impl Subscription {
    /// Next event, in publication order. Yields `KeepAlive` after the
    /// configured idle interval; returns `None` once the run is terminal and
    /// the queue is drained.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            let notified = self.state.notify.notified();
            {
                let mut queue = self.state.queue.lock().expect("subscriber queue lock");
                if queue.dropped_pending > 0 {
                    let n = queue.dropped_pending;
                    queue.dropped_pending = 0;
                    return Some(RunEvent::Dropped { n });
                }
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            match tokio::time::timeout(self.keep_alive, notified).await {
                Ok(_) => continue,
                Err(_) => return Some(RunEvent::KeepAlive),
            }
        }
    }
}

pub struct RunEventBus {
    channels: Mutex<HashMap<i64, Arc<RunChannel>>>,
    config: EventBusConfig,
}

impl RunEventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn register_run(&self, run_id: i64) {
        let mut channels = self.channels.lock().expect("channel map lock");
        channels.entry(run_id).or_insert_with(|| Arc::new(RunChannel::new()));
    }

    fn channel(&self, run_id: i64) -> Option<Arc<RunChannel>> {
        self.channels.lock().expect("channel map lock").get(&run_id).cloned()
    }

    /// Publish without ever blocking on a subscriber.
    pub fn publish(self: &Arc<Self>, run_id: i64, event: RunEvent) {
        let Some(channel) = self.channel(run_id) else {
            debug!(run_id, "event published to unknown run channel");
            return;
        };

        let terminal = event.is_terminal();
        if terminal {
            channel
                .terminal
                .lock()
                .expect("terminal event lock")
                .push(event.clone());
            channel.is_terminal.store(true, Ordering::SeqCst);
        }

        let subscribers = channel.subscribers.lock().expect("subscriber list lock");
        for subscriber in subscribers.iter() {
            let mut queue = subscriber.queue.lock().expect("subscriber queue lock");
            if queue.closed {
                continue;
            }
            if queue.events.len() >= self.config.queue_size {
                queue.events.pop_front();
                queue.dropped_pending += 1;
            }
            queue.events.push_back(event.clone());
            if terminal {
                queue.closed = true;
            }
            subscriber.notify.notify_one();
        }
        drop(subscribers);

        if terminal {
            let bus = Arc::clone(self);
            let grace = self.config.replay_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                bus.channels.lock().expect("channel map lock").remove(&run_id);
                debug!(run_id, "run event channel garbage-collected");
            });
        }
    }

    /// Subscribe to a run. Late subscribers to a finished run (within the
    /// replay grace period) receive the terminal events and then the stream
    /// closes. Unknown runs return `None`.
    pub fn subscribe(&self, run_id: i64) -> Option<Subscription> {
        let channel = self.channel(run_id)?;

        let state = Arc::new(SubscriberState {
            queue: Mutex::new(SubscriberQueue {
                events: VecDeque::new(),
                dropped_pending: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });

        if channel.is_terminal.load(Ordering::SeqCst) {
            let terminal = channel.terminal.lock().expect("terminal event lock");
            let mut queue = state.queue.lock().expect("subscriber queue lock");
            queue.events.extend(terminal.iter().cloned());
            queue.closed = true;
        } else {
            channel
                .subscribers
                .lock()
                .expect("subscriber list lock")
                .push(Arc::clone(&state));
        }

        Some(Subscription {
            state,
            keep_alive: self.config.keep_alive_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bus(queue_size: usize) -> Arc<RunEventBus> {
        Arc::new(RunEventBus::new(EventBusConfig {
            queue_size,
            keep_alive_interval: Duration::from_millis(50),
            replay_grace: Duration::from_millis(200),
        }))
    }

    #[tokio::test]
    async fn test_events_arrive_in_publication_order() {
        let bus = bus(16);
        bus.register_run(1);
        let mut sub = bus.subscribe(1).unwrap();

        for i in 0..4 {
            bus.publish(1, RunEvent::IterGenStart { i });
        }
        bus.publish(1, RunEvent::Done { status: "complete".into(), reason: None });

        let mut seen = Vec::new();
        while let Some(event) = sub.next().await {
            seen.push(event);
        }
        assert_eq!(seen.len(), 5);
        for (idx, event) in seen.iter().take(4).enumerate() {
            match event {
                RunEvent::IterGenStart { i } => assert_eq!(*i as usize, idx),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(seen[4].is_terminal());
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_drop_marker() {
        let bus = bus(2);
        bus.register_run(1);
        let mut sub = bus.subscribe(1).unwrap();

        for i in 0..5 {
            bus.publish(1, RunEvent::IterGenStart { i });
        }

        // Oldest three dropped; marker first, then the two surviving events.
        match sub.next().await {
            Some(RunEvent::Dropped { n }) => assert_eq!(n, 3),
            other => panic!("expected drop marker, got {:?}", other),
        }
        match sub.next().await {
            Some(RunEvent::IterGenStart { i }) => assert_eq!(i, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keep_alive_when_idle() {
        let bus = bus(16);
        bus.register_run(1);
        let mut sub = bus.subscribe(1).unwrap();

        match sub.next().await {
            Some(RunEvent::KeepAlive) => {}
            other => panic!("expected keep-alive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_terminal() {
        let bus = bus(16);
        bus.register_run(1);
        bus.publish(1, RunEvent::IterGenStart { i: 0 });
        bus.publish(
            1,
            RunEvent::Done { status: "cancelled".into(), reason: Some("timeout".into()) },
        );

        let mut late = bus.subscribe(1).unwrap();
        match late.next().await {
            Some(RunEvent::Done { status, reason }) => {
                assert_eq!(status, "cancelled");
                assert_eq!(reason.as_deref(), Some("timeout"));
            }
            other => panic!("expected terminal replay, got {:?}", other),
        }
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_gc_after_grace() {
        let bus = bus(16);
        bus.register_run(1);
        bus.publish(1, RunEvent::Done { status: "complete".into(), reason: None });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(bus.subscribe(1).is_none());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_full_stream() {
        let bus = bus(16);
        bus.register_run(1);
        let mut a = bus.subscribe(1).unwrap();
        let mut b = bus.subscribe(1).unwrap();

        bus.publish(1, RunEvent::IterGenStart { i: 0 });
        bus.publish(1, RunEvent::Done { status: "complete".into(), reason: None });

        for sub in [&mut a, &mut b] {
            assert!(matches!(sub.next().await, Some(RunEvent::IterGenStart { i: 0 })));
            assert!(matches!(sub.next().await, Some(RunEvent::Done { .. })));
            assert!(sub.next().await.is_none());
        }
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.123456), 0.123);
        assert_eq!(round3(0.9995), 1.0);
        assert_eq!(round3(-0.0004), -0.0);
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = RunEvent::IterSelected { i: 2, operator: "raise_temp".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "iter_selected");
        assert_eq!(json["i"], 2);
    }
}

use crate::config::MqttConfig;
use crate::shutdown::Shutdown;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct TopicQueue {
    queue: VecDeque<String>,
    last_hash: Option<u64>,
    dropped: u64,
}

#[derive(Default)]
struct SinkState {
    topics: HashMap<String, TopicQueue>,
}

/// MQTT publish sink.
///
/// Producers hand payloads to [`MqttSink::publish`]; consecutive duplicates
/// per topic are suppressed by payload hash and everything else goes into a
/// bounded per-topic FIFO (drop-oldest under backpressure). A worker task
/// drains the queues to the broker whenever the connection is up, QoS 1 and
/// retained, so a reconnecting subscriber always sees the latest state.
pub struct MqttSink {
    cfg: MqttConfig,
    client: AsyncClient,
    state: Mutex<SinkState>,
    connected: AtomicBool,
    wakeup: Notify,
    shutdown: Arc<Shutdown>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MqttSink {
    pub fn new(cfg: MqttConfig, shutdown: Arc<Shutdown>) -> Arc<Self> {
        info!("MQTT connecting to {}:{}", cfg.broker, cfg.port);

        let mut options = MqttOptions::new(env!("CARGO_PKG_NAME"), cfg.broker.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(5));
        if let Some(user) = &cfg.user {
            options.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 10);

        let sink = Arc::new(MqttSink {
            cfg,
            client,
            state: Mutex::new(SinkState::default()),
            connected: AtomicBool::new(false),
            wakeup: Notify::new(),
            shutdown,
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = sink.workers.lock().unwrap();
        workers.push(tokio::spawn(Arc::clone(&sink).event_loop_task(eventloop)));
        workers.push(tokio::spawn(Arc::clone(&sink).drain_task()));
        drop(workers);

        sink
    }

    /// Queue a payload for the topic. Never blocks; called synchronously from
    /// the meter pipeline's callbacks.
    pub fn publish(&self, payload: impl Into<String>, topic: impl Into<String>) {
        let payload = payload.into();
        let topic = topic.into();

        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        let payload_hash = hasher.finish();

        {
            let mut state = self.state.lock().unwrap();
            let entry = state.topics.entry(topic.clone()).or_default();

            if entry.last_hash == Some(payload_hash) {
                return;
            }
            entry.last_hash = Some(payload_hash);

            if entry.queue.len() >= self.cfg.queue_size {
                entry.queue.pop_front();
                entry.dropped += 1;
                warn!(
                    "MQTT queue full for topic '{topic}', dropped oldest message (total dropped: {})",
                    entry.dropped
                );
            } else if !self.connected.load(Ordering::Acquire) && !entry.queue.is_empty() {
                debug!(
                    "Waiting for MQTT connection... ({} messages cached for '{topic}')",
                    entry.queue.len()
                );
            }

            entry.queue.push_back(payload);
        }

        self.wakeup.notify_one();
    }

    /// Drive rumqttc and track the connection state, backing off between
    /// failed connection attempts per the configured schedule.
    async fn event_loop_task(self: Arc<Self>, mut eventloop: EventLoop) {
        let mut delay = self.cfg.reconnect_delay.min;

        while self.shutdown.is_running() {
            let event = tokio::select! {
                _ = self.shutdown.notified() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    self.connected.store(true, Ordering::Release);
                    delay = self.cfg.reconnect_delay.min;
                    self.wakeup.notify_one();
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        warn!("MQTT disconnected unexpectedly: {e}, will retry...");
                    } else {
                        warn!("MQTT connection failed: {e}, retrying in {delay}s");
                    }

                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    }
                    if self.cfg.reconnect_delay.exponential {
                        delay = (delay * 2).min(self.cfg.reconnect_delay.max);
                    }
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        debug!("MQTT event loop stopped");
    }

    /// Drain queued payloads whenever there is something to do and the
    /// connection is up. On shutdown, whatever is still queued is flushed
    /// while the connection lasts.
    async fn drain_task(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    if self.connected.load(Ordering::Acquire) && self.has_queued() {
                        debug!("Shutdown detected, flushing remaining messages");
                        self.drain().await;
                    }
                    break;
                }
                _ = self.wakeup.notified() => {
                    self.drain().await;
                }
            }
        }
        debug!("MQTT run loop stopped");
    }

    async fn drain(&self) {
        while self.connected.load(Ordering::Acquire) {
            // peek without holding the lock across the publish await
            let next = {
                let state = self.state.lock().unwrap();
                state.topics.iter().find_map(|(topic, entry)| {
                    entry
                        .queue
                        .front()
                        .map(|payload| (topic.clone(), payload.clone()))
                })
            };

            let Some((topic, payload)) = next else {
                return;
            };

            match self
                .client
                .publish(&topic, QoS::AtLeastOnce, true, payload.clone())
                .await
            {
                Ok(()) => {
                    debug!("Published MQTT message to topic '{topic}': {payload}");
                    let mut state = self.state.lock().unwrap();
                    if let Some(entry) = state.topics.get_mut(&topic) {
                        entry.queue.pop_front();
                        entry.dropped = 0;
                    }
                }
                Err(e) => {
                    error!("MQTT publish failed for '{topic}': {e}");
                    return;
                }
            }
        }
    }

    fn has_queued(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.topics.values().any(|entry| !entry.queue.is_empty())
    }

    /// Join the sink's tasks; meaningful only after shutdown was signalled.
    pub async fn stop(&self) {
        let _ = self.client.disconnect().await;
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    fn queued_for(&self, topic: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|entry| entry.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn dropped_for(&self, topic: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.topics.get(topic).map(|entry| entry.dropped).unwrap_or(0)
    }
}

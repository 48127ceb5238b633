// src/hub/broadcast.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::protocol::{ClientAction, ClientMessage, ServerMessage};

/// Capacity of each subscriber's send queue. On overflow the frame is
/// dropped for that subscriber; an executor is never blocked by a slow
/// consumer.
const SEND_QUEUE_CAPACITY: usize = 16;

/// Delay between a `complete` frame and closing the task's subscribers, so
/// queued frames can drain.
const COMPLETE_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How often the reaper sweeps for idle subscribers.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// A subscriber with no activity for this long is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub type SubscriberId = u64;

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    /// The one task this client is watching, if any. Changed only while the
    /// hub's write lock is held.
    subscribed_task: Mutex<Option<String>>,
    /// Guarded separately so broadcasts can refresh it under the hub's
    /// read lock.
    last_activity: Mutex<Instant>,
}

impl Subscriber {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Queue a frame, dropping it if the subscriber is slow or gone.
    fn send(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.touch();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("subscriber send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<SubscriberId, Arc<Subscriber>>,
    task_subscribers: HashMap<String, Vec<SubscriberId>>,
}

/// Process-wide fan-out of live log lines to subscribed clients.
///
/// State lives under one reader-writer lock: broadcasts acquire read,
/// subscription changes acquire write.
pub struct LogHub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
    stop: CancellationToken,
}

impl LogHub {
    /// Create the hub and spawn the idle-subscriber reaper.
    pub fn new(stop: CancellationToken) -> Arc<Self> {
        let hub = Arc::new(Self {
            state: RwLock::new(HubState::default()),
            next_id: AtomicU64::new(1),
            stop: stop.clone(),
        });

        let reaper = Arc::clone(&hub);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(REAP_INTERVAL) => reaper.reap_idle(),
                }
            }
            debug!("log hub reaper ended");
        });

        hub
    }

    /// Register a newly connected client.
    ///
    /// The client is inactive until it subscribes to a task. The returned
    /// receiver is the client's outbound frame stream.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let subscriber = Arc::new(Subscriber {
            tx,
            subscribed_task: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        });
        self.state.write().subscribers.insert(id, subscriber);

        debug!(subscriber = id, "client registered");
        (id, rx)
    }

    /// Remove a client from all hub state.
    pub fn disconnect(&self, id: SubscriberId) {
        let mut state = self.state.write();
        remove_subscriber(&mut state, id);
        debug!(subscriber = id, "client disconnected");
    }

    /// Handle one inbound client frame.
    pub fn handle_message(&self, id: SubscriberId, msg: ClientMessage) {
        match msg.action {
            ClientAction::Subscribe => {
                if !msg.task_id.is_empty() {
                    self.subscribe(id, &msg.task_id);
                }
            }
            ClientAction::Unsubscribe => self.disconnect(id),
            ClientAction::Ping => {
                let state = self.state.read();
                if let Some(sub) = state.subscribers.get(&id) {
                    sub.send(ServerMessage::pong());
                }
            }
        }
    }

    /// Subscribe a client to one task, atomically replacing any previous
    /// subscription. Acknowledged with a `subscribed` frame.
    pub fn subscribe(&self, id: SubscriberId, task_id: &str) {
        let mut state = self.state.write();

        let Some(subscriber) = state.subscribers.get(&id).cloned() else {
            return;
        };

        // Replacing the previous subscription (including a re-subscribe to
        // the same task) keeps the task index free of duplicates.
        let previous = subscriber.subscribed_task.lock().replace(task_id.to_string());
        if let Some(previous) = previous {
            detach_from_task(&mut state, &previous, id);
        }

        state
            .task_subscribers
            .entry(task_id.to_string())
            .or_default()
            .push(id);
        subscriber.touch();
        subscriber.send(ServerMessage::subscribed(task_id));

        info!(subscriber = id, task = %task_id, "client subscribed");
    }

    /// Forward one log line to every subscriber of the task.
    pub fn broadcast_log(&self, task_id: &str, content: &str) {
        let state = self.state.read();
        let Some(ids) = state.task_subscribers.get(task_id) else {
            return;
        };
        for id in ids {
            if let Some(sub) = state.subscribers.get(id) {
                sub.send(ServerMessage::log(task_id, content));
            }
        }
    }

    /// Announce task completion, then close its subscribers after a short
    /// grace period that lets queued frames drain.
    pub fn broadcast_task_complete(self: &Arc<Self>, task_id: &str) {
        {
            let state = self.state.read();
            if let Some(ids) = state.task_subscribers.get(task_id) {
                for id in ids {
                    if let Some(sub) = state.subscribers.get(id) {
                        sub.send(ServerMessage::complete(task_id));
                    }
                }
            }
        }

        let hub = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = hub.stop.cancelled() => {}
                _ = tokio::time::sleep(COMPLETE_CLOSE_GRACE) => {}
            }
            hub.close_task(&task_id);
        });
    }

    /// Close every subscriber of a task and forget the task id.
    fn close_task(&self, task_id: &str) {
        let mut state = self.state.write();
        let Some(ids) = state.task_subscribers.remove(task_id) else {
            return;
        };
        for id in ids {
            if let Some(sub) = state.subscribers.remove(&id) {
                sub.send(ServerMessage::close(task_id));
            }
        }
        debug!(task = %task_id, "closed all subscribers for task");
    }

    /// Drop subscribers whose last activity is older than the idle timeout.
    fn reap_idle(&self) {
        let mut state = self.state.write();

        let now = Instant::now();
        let idle: Vec<SubscriberId> = state
            .subscribers
            .iter()
            .filter(|(_, sub)| now.duration_since(*sub.last_activity.lock()) > IDLE_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        for id in idle {
            info!(subscriber = id, "closing idle subscriber");
            if let Some(sub) = state.subscribers.get(&id) {
                let task = sub.subscribed_task.lock().clone().unwrap_or_default();
                sub.send(ServerMessage::close(&task));
            }
            remove_subscriber(&mut state, id);
        }
    }

    /// Number of subscribers currently attached to a task.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.state
            .read()
            .task_subscribers
            .get(task_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}

fn remove_subscriber(state: &mut HubState, id: SubscriberId) {
    if let Some(sub) = state.subscribers.remove(&id) {
        let task = sub.subscribed_task.lock().clone();
        if let Some(task) = task {
            detach_from_task(state, &task, id);
        }
    }
}

fn detach_from_task(state: &mut HubState, task_id: &str, id: SubscriberId) {
    if let Some(ids) = state.task_subscribers.get_mut(task_id) {
        ids.retain(|other| *other != id);
        if ids.is_empty() {
            state.task_subscribers.remove(task_id);
        }
    }
}

//! Typed, topic-based publish/subscribe bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Messages travel as [`Arc<T>`] so a large point cloud is
//! shared, not copied, between subscribers.
//!
//! # Topics
//!
//! A topic is identified by its resolved name (see [`crate::names`]).  The
//! first endpoint that touches a topic fixes two things for the lifetime of
//! the bus:
//!
//! | Property | Effect |
//! |---|---|
//! | message type `T` | later endpoints with a different `T` are rejected |
//! | queue depth | messages buffered before the oldest are dropped for a slow subscriber |
//!
//! # Latching
//!
//! A publisher advertised with `latch = true` retains its last message and
//! hands it to subscribers that join afterwards.  Non-latched topics deliver
//! only what is published after a subscriber joined.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use normalcast_types::NormalsError;
use tokio::sync::broadcast;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// -----------------------------------------------------------------------
// Per-topic channel
// -----------------------------------------------------------------------

/// The broadcast sender for one topic plus the retained message of a
/// latched topic.
struct TopicChannel<T> {
    sender: broadcast::Sender<Arc<T>>,
    latched: Arc<Mutex<Option<Arc<T>>>>,
    depth: usize,
}

impl<T> Clone for TopicChannel<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            latched: Arc::clone(&self.latched),
            depth: self.depth,
        }
    }
}

impl<T: Send + Sync + 'static> TopicChannel<T> {
    fn new(depth: usize) -> Self {
        // broadcast::channel panics on a zero capacity.
        let depth = depth.max(1);
        let (sender, _) = broadcast::channel(depth);
        Self {
            sender,
            latched: Arc::new(Mutex::new(None)),
            depth,
        }
    }
}

/// Type-erased registry entry.
struct TopicSlot {
    type_name: &'static str,
    /// Always a `TopicChannel<T>` for the `T` named by `type_name`.
    channel: Box<dyn Any + Send + Sync>,
    receiver_count: Box<dyn Fn() -> usize + Send + Sync>,
}

impl TopicSlot {
    fn new<T: Send + Sync + 'static>(depth: usize) -> Self {
        let channel = TopicChannel::<T>::new(depth);
        let sender = channel.sender.clone();
        Self {
            type_name: type_name::<T>(),
            channel: Box::new(channel),
            receiver_count: Box::new(move || sender.receiver_count()),
        }
    }
}

// -----------------------------------------------------------------------
// EventBus
// -----------------------------------------------------------------------

/// Shared event bus. Clone it cheaply – all clones share the same topics.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, TopicSlot>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = lock(&self.topics);
        let mut names: Vec<&String> = topics.keys().collect();
        names.sort();
        f.debug_struct("EventBus").field("topics", &names).finish()
    }
}

impl EventBus {
    /// Create a bus with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::Channel`] when `topic` already carries a
    /// different message type.
    pub fn advertise<T: Send + Sync + 'static>(
        &self,
        topic: &str,
        depth: usize,
        latch: bool,
    ) -> Result<Publisher<T>, NormalsError> {
        let channel = self.channel::<T>(topic, depth)?;
        Ok(Publisher {
            topic: topic.to_string(),
            channel,
            latch,
        })
    }

    /// Subscribe to `topic`.
    ///
    /// A retained latched message, if any, is the first thing the returned
    /// [`Subscriber`] yields.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::Channel`] when `topic` already carries a
    /// different message type.
    pub fn subscribe<T: Send + Sync + 'static>(
        &self,
        topic: &str,
        depth: usize,
    ) -> Result<Subscriber<T>, NormalsError> {
        let channel = self.channel::<T>(topic, depth)?;
        // Hold the latch lock while subscribing so that a concurrent latched
        // publish is delivered exactly once.
        let latched = lock(&channel.latched);
        let receiver = channel.sender.subscribe();
        let pending = latched.clone();
        drop(latched);
        Ok(Subscriber {
            topic: topic.to_string(),
            receiver,
            pending,
        })
    }

    /// Number of live subscribers on `topic` (0 for unknown topics).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.topics)
            .get(topic)
            .map(|slot| (slot.receiver_count)())
            .unwrap_or(0)
    }

    fn channel<T: Send + Sync + 'static>(
        &self,
        topic: &str,
        depth: usize,
    ) -> Result<TopicChannel<T>, NormalsError> {
        let mut topics = lock(&self.topics);
        let slot = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, depth, message_type = type_name::<T>(), "creating topic");
            TopicSlot::new::<T>(depth)
        });
        let channel = slot
            .channel
            .downcast_ref::<TopicChannel<T>>()
            .cloned()
            .ok_or_else(|| {
                NormalsError::Channel(format!(
                    "topic {topic} carries {}, not {}",
                    slot.type_name,
                    type_name::<T>()
                ))
            })?;
        if channel.depth != depth.max(1) {
            debug!(
                topic,
                requested = depth,
                effective = channel.depth,
                "topic queue depth already fixed"
            );
        }
        Ok(channel)
    }
}

// -----------------------------------------------------------------------
// Publisher
// -----------------------------------------------------------------------

/// Sending half of a topic.  Obtained via [`EventBus::advertise`].
pub struct Publisher<T> {
    topic: String,
    channel: TopicChannel<T>,
    latch: bool,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            latch: self.latch,
        }
    }
}

impl<T: Send + Sync + 'static> Publisher<T> {
    /// Publish `message` to every current subscriber.
    ///
    /// Returns the number of subscribers that were handed the message.
    /// `0` means nobody is listening, which is a normal condition.
    pub fn publish(&self, message: T) -> usize {
        let message = Arc::new(message);
        if self.latch {
            let mut latched = lock(&self.channel.latched);
            *latched = Some(Arc::clone(&message));
            self.channel.sender.send(message).unwrap_or(0)
        } else {
            self.channel.sender.send(message).unwrap_or(0)
        }
    }

    /// Number of subscribers currently attached to this topic.
    pub fn subscriber_count(&self) -> usize {
        self.channel.sender.receiver_count()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

// -----------------------------------------------------------------------
// Subscriber
// -----------------------------------------------------------------------

/// Receiving half of a topic.  Obtained via [`EventBus::subscribe`].
///
/// Dropping the subscriber detaches it; publishers see the subscriber
/// count go down immediately.
pub struct Subscriber<T> {
    topic: String,
    receiver: broadcast::Receiver<Arc<T>>,
    pending: Option<Arc<T>>,
}

impl<T: Send + Sync + 'static> Subscriber<T> {
    /// Wait for the next message on this topic.
    ///
    /// A subscriber that fell behind skips the messages it lost and logs a
    /// warning.  Returns `None` once the bus and every publisher on the topic
    /// are gone.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        if let Some(message) = self.pending.take() {
            return Some(message);
        }
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, dropped = n, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`][Self::recv]; `None` when nothing is
    /// queued.
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        if let Some(message) = self.pending.take() {
            return Some(message);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, dropped = n, "subscriber lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

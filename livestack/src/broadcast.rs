//! Non-blocking fan-out of display artifacts and log lines to attached subscribers.
//!
//! Every subscriber owns an unbounded channel. Publishing clones an `Arc` of the event
//! into each channel and never waits on a slow consumer. The registry lock is held only
//! for map operations; nothing in this module logs while holding it, because the log
//! bridge publishes through the same registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::keyer::CompositeKey;

common::id_type!(SubscriptionId);

/// An encoded display image of one composite.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub key: CompositeKey,
    pub content_type: &'static str,
    /// Where the artifact was written.
    pub path: PathBuf,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Log(Arc<str>),
    Artifact(Arc<Artifact>),
}

struct Slot {
    tx: UnboundedSender<StreamEvent>,
    attached: Arc<AtomicBool>,
}

type Registry = Mutex<HashMap<SubscriptionId, Slot>>;

#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber with a fresh channel.
    pub fn attach(&self) -> Subscription {
        let id = SubscriptionId::unique();
        let (tx, rx) = mpsc::unbounded_channel();
        let attached = Arc::new(AtomicBool::new(true));

        self.registry.lock().insert(
            id,
            Slot {
                tx,
                attached: attached.clone(),
            },
        );
        log::debug!("subscriber {id} attached");

        Subscription {
            id,
            rx,
            attached,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Removes a subscriber. Events it has not received yet are discarded.
    pub fn detach(&self, id: SubscriptionId) -> bool {
        let removed = remove_slot(&self.registry, id);
        if removed {
            log::debug!("subscriber {id} detached");
        }
        removed
    }

    /// Sends `event` to every attached subscriber. Channels whose receiver is gone are
    /// pruned. Returns the number of deliveries.
    pub fn publish(&self, event: StreamEvent) -> usize {
        let mut delivered = 0;
        self.registry
            .lock()
            .retain(|_, slot| match slot.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    slot.attached.store(false, Ordering::Release);
                    false
                }
            });
        delivered
    }

    pub fn publish_log(&self, line: impl Into<Arc<str>>) -> usize {
        self.publish(StreamEvent::Log(line.into()))
    }

    pub fn publish_artifact(&self, artifact: Artifact) -> usize {
        self.publish(StreamEvent::Artifact(Arc::new(artifact)))
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }
}

fn remove_slot(registry: &Registry, id: SubscriptionId) -> bool {
    let slot = registry.lock().remove(&id);
    match slot {
        Some(slot) => {
            slot.attached.store(false, Ordering::Release);
            true
        }
        None => false,
    }
}

/// Receiving end of one attachment. Dropping it detaches.
pub struct Subscription {
    id: SubscriptionId,
    rx: UnboundedReceiver<StreamEvent>,
    attached: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Next event, or `None` once detached.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if !self.is_attached() {
            return None;
        }
        let event = self.rx.recv().await?;
        self.is_attached().then_some(event)
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        if !self.is_attached() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if remove_slot(&registry, self.id) {
                log::debug!("subscriber {} detached", self.id);
            }
        }
    }
}

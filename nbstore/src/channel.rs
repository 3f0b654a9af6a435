//! In-process broadcast channels for cross-tab fan-out.
//!
//! Two engine instances that share a [`ChannelHub`] behave like two browser
//! tabs: any port opened under the same name receives what the others post.
//! A port never receives its own messages.
//!
//! ```text
//! Tab A ── port(a) ──┐                       ┌── port(b) ── Tab B
//!                    ├── ChannelGroup(name) ─┤
//! Tab A ── port(c) ──┘   (tokio broadcast)   └── port(d) ── Tab C
//! ```
//!
//! Each group wraps one tokio broadcast sender, so a post is O(1) regardless
//! of the number of ports. Receivers that fall more than `capacity` messages
//! behind lose the oldest ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::{Emitter, Subscription};

/// A message travelling through a channel group.
#[derive(Debug, Clone)]
struct Envelope {
    sender: Uuid,
    payload: Arc<Vec<u8>>,
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub open_ports: usize,
}

/// All ports sharing one channel name.
struct ChannelGroup {
    sender: broadcast::Sender<Envelope>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ChannelGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Maps channel names to groups.
///
/// One hub stands for one device: hand the same hub to every engine that
/// should see the others' messages.
#[derive(Clone)]
pub struct ChannelHub {
    groups: Arc<Mutex<HashMap<String, Weak<ChannelGroup>>>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Open a new port on the channel `name`.
    ///
    /// Must be called from within a tokio runtime: the port spawns a task
    /// that delivers incoming messages to its listeners.
    pub fn open(&self, name: impl Into<String>) -> BroadcastChannel {
        let name = name.into();
        let group = {
            let mut groups = self.groups.lock();
            match groups.get(&name).and_then(Weak::upgrade) {
                Some(group) => group,
                None => {
                    let group = Arc::new(ChannelGroup::new(self.capacity));
                    groups.insert(name.clone(), Arc::downgrade(&group));
                    group
                }
            }
        };
        BroadcastChannel::new(name, group)
    }

    /// Number of channel names with at least one open port.
    pub fn channel_count(&self) -> usize {
        let mut groups = self.groups.lock();
        groups.retain(|_, g| g.strong_count() > 0);
        groups.len()
    }

    pub fn stats(&self, name: &str) -> Option<ChannelStats> {
        let group = self.groups.lock().get(name).and_then(Weak::upgrade)?;
        Some(ChannelStats {
            messages_sent: group.messages_sent.load(Ordering::Relaxed),
            messages_dropped: group.messages_dropped.load(Ordering::Relaxed),
            open_ports: group.sender.receiver_count(),
        })
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One port of a named channel.
pub struct BroadcastChannel {
    id: Uuid,
    name: String,
    group: Arc<ChannelGroup>,
    messages: Arc<Emitter<Arc<Vec<u8>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastChannel {
    fn new(name: String, group: Arc<ChannelGroup>) -> Self {
        let id = Uuid::new_v4();
        let messages = Arc::new(Emitter::new());
        let mut rx = group.sender.subscribe();

        let emitter = messages.clone();
        let dropped_group = Arc::downgrade(&group);
        let channel_name = name.clone();
        let reader = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.sender != id {
                            emitter.emit(&envelope.payload);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Channel {channel_name} lagged, {n} messages dropped");
                        if let Some(group) = dropped_group.upgrade() {
                            group.messages_dropped.fetch_add(n, Ordering::Relaxed);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            id,
            name,
            group,
            messages,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every other port of this channel.
    ///
    /// Returns the number of ports that will see the message.
    pub fn post(&self, payload: Vec<u8>) -> usize {
        let receivers = self
            .group
            .sender
            .send(Envelope {
                sender: self.id,
                payload: Arc::new(payload),
            })
            .unwrap_or(0);
        self.group.messages_sent.fetch_add(1, Ordering::Relaxed);
        receivers.saturating_sub(1)
    }

    /// Register a listener for messages posted by other ports.
    pub fn on_message(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> Subscription {
        self.messages.subscribe(move |payload| listener(payload.as_slice()))
    }

    /// Stop receiving. Further posts from this port still go out.
    pub fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.reader.lock().is_none()
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

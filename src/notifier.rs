//! Named fan-out channels broadcasting per-index content updates and run
//! lifecycle events to any number of listeners.
//!
//! Publishing never blocks and never requires a listener to be present. A
//! terminal message (`GENERATION_COMPLETE` / `GENERATION_ERROR`) is followed
//! by a short linger before the channel is removed, so messages already in
//! flight reach late receivers. Delivery is FIFO per publisher; there is no
//! ordering guarantee relative to store writes — consumers reconcile the two
//! views by content length (see `PersistedResultSet::reconcile`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Well-known channel name the result views subscribe to.
pub const RESULT_CHANNEL: &str = "generation-results";

/// How long a channel stays open after a terminal message.
pub const CLOSE_LINGER: Duration = Duration::from_millis(500);

const CHANNEL_CAPACITY: usize = 256;

/// Every message is self-contained: `UpdateContent` carries the full current
/// content for its index, never a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    /// A listener context announces it is attached and rendering `index`.
    #[serde(rename = "DETAIL_READY")]
    Ready { index: usize },
    /// Latest accumulated content for one index.
    #[serde(rename = "UPDATE_CONTENT")]
    UpdateContent { index: usize, content: String },
    /// Terminal: the run finished normally.
    #[serde(rename = "GENERATION_COMPLETE")]
    GenerationComplete,
    /// Terminal: the run failed; partial content remains readable.
    #[serde(rename = "GENERATION_ERROR")]
    GenerationError,
}

impl ChannelMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelMessage::GenerationComplete | ChannelMessage::GenerationError
        )
    }
}

/// Registry of named broadcast channels, shared by every context in the
/// process. Cheap to clone; an injected handle, not a global.
#[derive(Clone, Default)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        ChannelHub::default()
    }

    fn sender(&self, name: &str) -> broadcast::Sender<ChannelMessage> {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a named channel, creating it if needed.
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<ChannelMessage> {
        self.sender(name).subscribe()
    }

    /// Publish without blocking. Returns how many listeners received the
    /// message; zero listeners is not an error.
    pub fn publish(&self, name: &str, message: ChannelMessage) -> usize {
        self.sender(name).send(message).unwrap_or(0)
    }

    /// Listeners currently attached to `name`.
    pub fn receiver_count(&self, name: &str) -> usize {
        let channels = self.channels.lock().expect("hub lock poisoned");
        channels.get(name).map_or(0, |tx| tx.receiver_count())
    }

    /// Remove a channel after the linger window, letting in-flight messages
    /// drain to attached receivers first.
    pub fn close_after_drain(&self, name: &str) {
        let hub = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_LINGER).await;
            let removed = hub
                .channels
                .lock()
                .expect("hub lock poisoned")
                .remove(&name)
                .is_some();
            if removed {
                debug!(channel = %name, "closed broadcast channel");
            }
        });
    }

    /// True while the named channel exists in the registry.
    pub fn is_open(&self, name: &str) -> bool {
        self.channels
            .lock()
            .expect("hub lock poisoned")
            .contains_key(name)
    }
}

//! Shared message history.
//!
//! A fixed-capacity FIFO of the most recently submitted messages, kept for
//! server-side diagnostics. The ring uses two exclusive cursors:
//! - `oldest` points one slot *before* the oldest live entry
//! - `newest` points at the next free write slot
//!
//! The ring therefore allocates `capacity + 1` slots; the slot under
//! `oldest` is always stale and is never reported.
//!
//! All access goes through [`History`], which serializes appends and dumps
//! behind a mutex so that concurrent sessions never touch the cursors.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Outcome of bounding a message to the configured capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Message fit and was kept as-is
    Stored,
    /// Message was cut down to `capacity - 1` characters
    Truncated {
        /// Length of the submitted text in characters
        original_len: usize,
    },
}

/// A single chat message, at most `capacity - 1` characters long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message(String);

impl Message {
    /// Bound `text` to a buffer of `capacity` slots (one reserved for the
    /// terminator), truncating on a character boundary when needed.
    pub fn new(text: impl Into<String>, capacity: usize) -> (Self, AppendResult) {
        let mut text = text.into();
        let max_chars = capacity.saturating_sub(1);

        match text.char_indices().nth(max_chars) {
            Some((cut, _)) => {
                let original_len = text.chars().count();
                text.truncate(cut);
                (Message(text), AppendResult::Truncated { original_len })
            }
            None => (Message(text), AppendResult::Stored),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Circular buffer with exclusive `oldest`/`newest` cursors.
///
/// Not synchronized; wrap it in [`History`] to share it.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<Message>>,
    oldest: usize,
    newest: usize,
}

impl RingBuffer {
    /// Create an empty ring holding at most `capacity` messages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be > 0");
        let slot_count = capacity + 1;
        Self {
            slots: vec![None; slot_count],
            oldest: slot_count - 1,
            newest: 0,
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let n = self.slot_count();
        (self.newest + n - self.oldest - 1) % n
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current `(oldest, newest)` cursor positions.
    pub fn cursors(&self) -> (usize, usize) {
        (self.oldest, self.newest)
    }

    /// Write `message` at `newest`, evicting the oldest entry when full.
    pub fn push(&mut self, message: Message) {
        let n = self.slot_count();
        self.slots[self.newest] = Some(message);

        if self.newest == self.oldest {
            self.oldest = (self.oldest + 1) % n;
        }

        self.newest = (self.newest + 1) % n;
    }

    /// Most recently pushed entry.
    #[cfg(test)]
    pub fn latest(&self) -> Option<&Message> {
        if self.is_empty() {
            return None;
        }
        let n = self.slot_count();
        self.slots[(self.newest + n - 1) % n].as_ref()
    }

    /// Live entries from oldest to newest. The slot under `oldest` is skipped.
    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        let n = self.slot_count();
        let start = (self.oldest + 1) % n;
        (0..self.len()).filter_map(move |i| self.slots[(start + i) % n].as_ref())
    }
}

/// Process-wide message history shared by every session.
pub struct History {
    ring: Mutex<RingBuffer>,
    message_capacity: usize,
}

impl History {
    /// Create a history of `history_capacity` messages, each bounded to a
    /// buffer of `message_capacity` slots.
    pub fn new(history_capacity: usize, message_capacity: usize) -> Arc<Self> {
        debug!(history_capacity, message_capacity, "Initializing history");
        Arc::new(Self {
            ring: Mutex::new(RingBuffer::new(history_capacity)),
            message_capacity,
        })
    }

    fn ring(&self) -> MutexGuard<'_, RingBuffer> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Longest message kept, in characters.
    pub fn max_message_len(&self) -> usize {
        self.message_capacity.saturating_sub(1)
    }

    /// Bound `text` and record it, returning whether it was truncated.
    #[cfg(test)]
    pub fn append(&self, text: &str) -> AppendResult {
        self.record(text).1
    }

    /// Append `text` and return the stored (possibly truncated) form.
    pub fn record(&self, text: &str) -> (Message, AppendResult) {
        let (message, result) = Message::new(text, self.message_capacity);

        if let AppendResult::Truncated { original_len } = result {
            warn!(
                original_len,
                max_len = self.max_message_len(),
                "Oversized message truncated"
            );
        }

        let mut ring = self.ring();
        ring.push(message.clone());

        let (oldest, newest) = ring.cursors();
        debug!(
            oldest,
            newest,
            entries = ?ring.iter().map(Message::as_str).collect::<Vec<_>>(),
            "History updated"
        );

        (message, result)
    }

    /// Snapshot of all live entries, oldest first.
    pub fn dump(&self) -> Vec<String> {
        self.ring().iter().map(|m| m.as_str().to_string()).collect()
    }

    /// Most recently recorded message.
    #[cfg(test)]
    pub fn latest(&self) -> Option<String> {
        self.ring().latest().map(|m| m.as_str().to_string())
    }

    pub fn len(&self) -> usize {
        self.ring().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }
}

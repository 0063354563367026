//! In-memory message store
//!
//! Messages live in slots. Dropping a message tombstones its slot (id 0),
//! and the next accepted message is written into the first tombstoned slot.
//! Ids come from a counter starting at 1 and are never reused.

use crate::crypto::ProofOfWork;
use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use std::cmp::Ordering;
use tokio::sync::RwLock;
use tracing::debug;

/// Id carried by an empty slot
pub const TOMBSTONE_ID: u64 = 0;

/// An accepted broadcast message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    /// Header plus every proof chunk received
    pub buffer: Vec<u8>,
    /// Decoded header with the padding trimmed
    pub text: String,
    /// Total chained work at acceptance time
    pub cost: BigUint,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// The empty value written over a dropped message
    pub fn tombstone() -> Self {
        Self {
            id: TOMBSTONE_ID,
            buffer: Vec::new(),
            text: String::new(),
            cost: BigUint::default(),
            received_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn is_live(&self) -> bool {
        self.id != TOMBSTONE_ID
    }

    /// Listing order: tombstones first, then ascending cost, then earliest
    /// receipt.
    pub fn rank(&self, other: &Self) -> Ordering {
        self.is_live()
            .cmp(&other.is_live())
            .then_with(|| self.cost.cmp(&other.cost))
            .then_with(|| self.received_at.cmp(&other.received_at))
    }
}

#[derive(Debug)]
struct StoreState {
    slots: Vec<Message>,
    next_id: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            slots: Vec::with_capacity(8),
            next_id: 1,
        }
    }
}

impl StoreState {
    fn position(&self, id: u64) -> Option<usize> {
        if id == TOMBSTONE_ID {
            return None;
        }
        self.slots.iter().position(|m| m.id == id)
    }
}

/// Slot table of accepted messages
#[derive(Debug, Default)]
pub struct MessageStore {
    state: RwLock<StoreState>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message and return its freshly assigned id.
    ///
    /// Identical buffers are stored as independent messages.
    pub async fn accept(&self, buffer: Vec<u8>, text: String, cost: BigUint) -> u64 {
        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;

        let message = Message {
            id,
            buffer,
            text,
            cost,
            received_at: Utc::now(),
        };

        match state.slots.iter().position(|m| !m.is_live()) {
            Some(slot) => {
                debug!("Message {} reuses slot {}", id, slot);
                state.slots[slot] = message;
            },
            None => state.slots.push(message),
        }
        id
    }

    /// Live messages in listing order
    pub async fn list(&self) -> Vec<Message> {
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state.slots.iter().filter(|m| m.is_live()).cloned().collect();
        messages.sort_by(Message::rank);
        messages
    }

    /// Look up a live message
    pub async fn get(&self, id: u64) -> Option<Message> {
        let state = self.state.read().await;
        state.position(id).map(|slot| state.slots[slot].clone())
    }

    pub async fn contains(&self, id: u64) -> bool {
        self.state.read().await.position(id).is_some()
    }

    /// Slot index currently holding `id`
    pub async fn slot_of(&self, id: u64) -> Option<usize> {
        self.state.read().await.position(id)
    }

    /// Number of live messages
    pub async fn len(&self) -> usize {
        self.state.read().await.slots.iter().filter(|m| m.is_live()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Buffer to rebroadcast for `id`, strengthened by one more chunk worth
    /// at least `min_work` when given.
    ///
    /// The stored message is left untouched.
    pub async fn like(
        &self,
        id: u64,
        min_work: Option<BigUint>,
        pow: &ProofOfWork,
    ) -> Result<Vec<u8>> {
        let buffer = self
            .get(id)
            .await
            .map(|m| m.buffer)
            .ok_or(StorageError::MessageNotFound { id })?;

        match min_work {
            Some(min_work) => pow.extend(buffer, min_work).await,
            None => Ok(buffer),
        }
    }

    /// Drop a message by tombstoning the slot holding `id`. Local only;
    /// peers keep their copies.
    pub async fn tombstone(&self, id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .position(id)
            .ok_or(StorageError::MessageNotFound { id })?;
        state.slots[slot] = Message::tombstone();
        Ok(())
    }
}

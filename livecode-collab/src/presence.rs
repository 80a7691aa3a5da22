//! Presence (awareness) state: who is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! editor cursor move
//!       │
//!       ▼
//! PresenceUpdate { replica_id, clock, state }   (bincode)
//!       │
//!       ▼   ClientMessage::Presence
//! coordinator AwarenessTable::apply()  ── last-writer-wins per replica_id
//!       │
//!       ▼   ServerMessage::Presence (raw bytes)
//! remote AwarenessTable::apply()
//! ```
//!
//! Entries never expire on their own. The coordinator removes a replica's
//! entry when its member leaves and tells the room via `PresenceRemoved`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::protocol::{ProtocolError, ReplicaId};

/// Cursor or selection in document offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor: u32,
    pub head: u32,
}

impl CursorPosition {
    pub fn caret(offset: u32) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }

    pub fn is_selection(&self) -> bool {
        self.anchor != self.head
    }
}

/// What a replica advertises about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub display_name: String,
    /// CSS hex color, e.g. `#3b82f6`.
    pub color: String,
    pub cursor: Option<CursorPosition>,
}

/// Presence wire message: one replica's state at logical time `clock`.
///
/// `state: None` clears the replica's entry (e.g. editor lost focus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub replica_id: ReplicaId,
    pub clock: u64,
    pub state: Option<PresenceState>,
}

impl PresenceUpdate {
    pub fn new(replica_id: ReplicaId, clock: u64, state: PresenceState) -> Self {
        Self {
            replica_id,
            clock,
            state: Some(state),
        }
    }

    pub fn cleared(replica_id: ReplicaId, clock: u64) -> Self {
        Self {
            replica_id,
            clock,
            state: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }
}

/// Stored awareness entry.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub clock: u64,
    pub state: Option<PresenceState>,
    pub updated_at: Instant,
}

/// Ephemeral presence per replica, merged last-writer-wins on `clock`.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    entries: HashMap<ReplicaId, AwarenessEntry>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update. Returns `false` if it was older than what we hold.
    ///
    /// Equal clocks are accepted so that a replayed announcement after
    /// `RequestPresenceReplay` is not mistaken for a stale one.
    pub fn apply(&mut self, update: &PresenceUpdate) -> bool {
        if let Some(existing) = self.entries.get(&update.replica_id) {
            if update.clock < existing.clock {
                return false;
            }
        }
        self.entries.insert(
            update.replica_id,
            AwarenessEntry {
                clock: update.clock,
                state: update.state.clone(),
                updated_at: Instant::now(),
            },
        );
        true
    }

    /// Drop a replica's entry (explicit eviction, never expiry).
    pub fn remove(&mut self, replica_id: ReplicaId) -> Option<AwarenessEntry> {
        self.entries.remove(&replica_id)
    }

    pub fn get(&self, replica_id: ReplicaId) -> Option<&AwarenessEntry> {
        self.entries.get(&replica_id)
    }

    /// Visible states (cleared entries are skipped).
    pub fn states(&self) -> impl Iterator<Item = (ReplicaId, &PresenceState)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| entry.state.as_ref().map(|state| (*id, state)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Stable, visually distinct default color for a replica.
///
/// HSL with fixed saturation/lightness; the hue comes from the replica id.
pub fn color_for_replica(replica_id: ReplicaId) -> String {
    let hue = ((replica_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

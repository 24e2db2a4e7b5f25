use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{track::lenient_track, RoomId, Track, UserId};

/// A user present in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub is_ready: bool,
}

/// The full, authoritative state of a room at a point in time.
///
/// A snapshot always replaces the previous one wholesale. Nothing diffs or
/// patches it outside the defined transitions, which is what makes applying
/// the same snapshot twice harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    /// Everyone in the room, including the host, keyed by user id. The wire
    /// calls this map `joiners`.
    #[serde(rename = "joiners", default)]
    pub participants: BTreeMap<UserId, Participant>,
    #[serde(default, deserialize_with = "lenient_track")]
    pub current_track: Option<Track>,
    #[serde(default)]
    pub position_ms: u64,
    #[serde(default)]
    pub is_playing: bool,
    /// Ready set as sent by the server. Folded into the participants by
    /// [`RoomSnapshot::normalize`] and empty afterwards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joiners_ready: Vec<UserId>,
}

impl RoomSnapshot {
    /// Folds the wire-level `joiners_ready` list into the participants'
    /// `is_ready` flags. Ids that match no participant are ignored.
    pub fn normalize(mut self) -> Self {
        let ready: Vec<UserId> = self.joiners_ready.drain(..).collect();

        for user_id in ready {
            if let Some(participant) = self.participants.get_mut(&user_id) {
                participant.is_ready = true;
            }
        }

        self
    }

    /// Returns the host, if the snapshot has one.
    pub fn host(&self) -> Option<&Participant> {
        self.participants.values().find(|p| p.is_host)
    }

    /// Returns the first non-host participant in iteration order, which is
    /// the fixed transfer-host target.
    pub fn first_joiner(&self) -> Option<&Participant> {
        self.participants.values().find(|p| !p.is_host)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    /// Clears every participant's ready flag.
    pub fn clear_ready_flags(&mut self) {
        for participant in self.participants.values_mut() {
            participant.is_ready = false;
        }
    }
}

use serde::Deserialize;

use crate::{track::lenient_track, RoomSnapshot, Track, UserId};

/// A push event for the current room, as delivered by the event channel.
///
/// This is the closed set of events the session reacts to. Payloads are
/// validated here, at the serde boundary; a frame that doesn't match a
/// variant is dropped before it can reach the transition logic.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A user joined the room. Carries the full snapshot.
    UserJoined { room: RoomSnapshot },
    /// A user left the room. Carries the full snapshot.
    UserLeft { user_id: UserId, room: RoomSnapshot },
    /// The host role moved to another participant.
    HostTransferred {
        new_host_id: UserId,
        room: RoomSnapshot,
    },
    /// The host asked everyone to align their playback.
    SyncRequested {
        #[serde(default, deserialize_with = "lenient_track")]
        current_track: Option<Track>,
        #[serde(default)]
        position_ms: u64,
        #[serde(default)]
        is_playing: bool,
    },
    /// Every joiner signalled readiness for a synchronized start.
    AllReady {
        #[serde(default, deserialize_with = "lenient_track")]
        current_track: Option<Track>,
        #[serde(default)]
        position_ms: u64,
        #[serde(default)]
        is_playing: bool,
    },
    /// The room no longer exists. Terminal for the room.
    RoomDeleted,
}

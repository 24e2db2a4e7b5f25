use serde::{Deserialize, Serialize};

use crate::{RoomEvent, RoomId, RoomSnapshot, Track, UserId};

/// The local user's relationship to the current room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    None,
    Host,
    Joiner,
}

/// Derives the local role from a snapshot.
///
/// The snapshot is authoritative. A stored or previously derived role is only
/// ever a cache of this function's result, never the other way around.
pub fn derive_role(user_id: &str, snapshot: &RoomSnapshot) -> Role {
    match snapshot.participants.get(user_id) {
        Some(participant) if participant.is_host => Role::Host,
        Some(_) => Role::Joiner,
        None => Role::None,
    }
}

/// A side effect requested by a state transition, carried out against an
/// external collaborator by the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Seek the local player to the given track and position.
    AlignPlayback {
        track: Option<Track>,
        position_ms: u64,
        is_playing: bool,
    },
    /// Start local playback.
    BeginPlayback,
    /// The room is gone and the session state was cleared.
    SessionCleared,
}

/// The local session: everything that survives a reload, plus the ephemeral
/// display values derived from it.
///
/// Owned by the session controller. Every reaction to an inbound event goes
/// through [`LocalSession::apply`], one event at a time, to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSession {
    pub user_id: Option<UserId>,
    pub display_name: Option<String>,
    pub room_id: Option<RoomId>,
    pub role: Role,
    pub is_ready: bool,
    /// The "N of M ready" consensus display value. Never persisted.
    pub ready_progress: Option<(u32, u32)>,
    pub snapshot: Option<RoomSnapshot>,
    pub auth_token: Option<String>,
}

impl LocalSession {
    pub fn in_room(&self) -> bool {
        self.room_id.is_some()
    }

    /// Replaces the snapshot wholesale and re-derives role and readiness
    /// from it.
    pub fn replace_snapshot(&mut self, snapshot: RoomSnapshot) {
        let snapshot = snapshot.normalize();

        self.room_id = Some(snapshot.room_id.clone());

        self.role = self
            .user_id
            .as_deref()
            .map(|user_id| derive_role(user_id, &snapshot))
            .unwrap_or(Role::None);

        self.is_ready = self
            .user_id
            .as_deref()
            .and_then(|user_id| snapshot.participants.get(user_id))
            .map(|p| p.is_ready)
            .unwrap_or(false);

        self.snapshot = Some(snapshot);
    }

    /// Clears everything tied to the current room.
    pub fn clear_room(&mut self) {
        self.room_id = None;
        self.role = Role::None;
        self.is_ready = false;
        self.ready_progress = None;
        self.snapshot = None;
    }

    /// Applies an inbound room event and returns the side effects it asks
    /// for.
    ///
    /// Total over all event kinds: events carrying a snapshot replace the
    /// current one directly, with no diffing, even when no prior snapshot
    /// exists. Events arriving while no room is active are stale and ignored,
    /// so nothing can resurrect a session after a leave or deletion.
    pub fn apply(&mut self, event: RoomEvent) -> Vec<Effect> {
        if !self.in_room() {
            return Vec::new();
        }

        match event {
            RoomEvent::UserJoined { room } => {
                self.replace_snapshot(room);
                self.check_membership()
            }
            RoomEvent::UserLeft { room, .. } => {
                self.replace_snapshot(room);
                self.check_membership()
            }
            RoomEvent::HostTransferred { room, .. } => {
                // The new host id is implied by the snapshot's is_host flags,
                // which are the source of truth for the derived role.
                self.replace_snapshot(room);
                self.ready_progress = None;
                self.check_membership()
            }
            RoomEvent::SyncRequested {
                current_track,
                position_ms,
                is_playing,
            } => {
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.current_track = current_track.clone();
                    snapshot.position_ms = position_ms;
                    snapshot.is_playing = is_playing;
                }

                // Every participant aligns, the host included.
                vec![Effect::AlignPlayback {
                    track: current_track,
                    position_ms,
                    is_playing,
                }]
            }
            RoomEvent::AllReady {
                current_track,
                position_ms,
                is_playing,
            } => {
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.clear_ready_flags();

                    if let Some(track) = current_track {
                        snapshot.current_track = Some(track);
                        snapshot.position_ms = position_ms;
                    }

                    snapshot.is_playing = is_playing;
                }

                self.is_ready = false;
                self.ready_progress = None;

                if is_playing {
                    vec![Effect::BeginPlayback]
                } else {
                    Vec::new()
                }
            }
            RoomEvent::RoomDeleted => {
                self.clear_room();
                vec![Effect::SessionCleared]
            }
        }
    }

    /// Clears the session if the local user is no longer a member of the
    /// current snapshot.
    fn check_membership(&mut self) -> Vec<Effect> {
        let present = match (self.user_id.as_deref(), self.snapshot.as_ref()) {
            (Some(user_id), Some(snapshot)) => snapshot.contains(user_id),
            _ => false,
        };

        if present {
            Vec::new()
        } else {
            self.clear_room();
            vec![Effect::SessionCleared]
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{room::test::snapshot, Effect, Role, RoomEvent};

    use super::LocalSession;

    fn session_in_room(user_id: &str) -> LocalSession {
        let mut session = LocalSession {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        };

        session.replace_snapshot(snapshot("r1", &[("u1", "Alice"), ("u2", "Bob")]));
        session
    }

    #[test]
    fn replacing_a_snapshot_derives_the_role() {
        let host = session_in_room("u1");
        let joiner = session_in_room("u2");

        assert_eq!(host.role, Role::Host);
        assert_eq!(joiner.role, Role::Joiner);
    }

    #[test]
    fn every_snapshot_has_exactly_one_host() {
        let mut session = session_in_room("u1");

        let events = [
            RoomEvent::UserJoined {
                room: snapshot("r1", &[("u1", "Alice"), ("u2", "Bob"), ("u3", "Eve")]),
            },
            RoomEvent::HostTransferred {
                new_host_id: "u2".to_string(),
                room: snapshot("r1", &[("u2", "Bob"), ("u1", "Alice"), ("u3", "Eve")]),
            },
            RoomEvent::UserLeft {
                user_id: "u3".to_string(),
                room: snapshot("r1", &[("u2", "Bob"), ("u1", "Alice")]),
            },
        ];

        for event in events {
            session.apply(event);

            let hosts = session
                .snapshot
                .as_ref()
                .unwrap()
                .participants
                .values()
                .filter(|p| p.is_host)
                .count();

            assert_eq!(hosts, 1);
        }
    }

    #[test]
    fn applying_the_same_snapshot_twice_is_idempotent() {
        let mut session = session_in_room("u1");

        let event = RoomEvent::UserJoined {
            room: snapshot("r1", &[("u1", "Alice"), ("u2", "Bob"), ("u3", "Eve")]),
        };

        session.apply(event.clone());
        let once = session.clone();

        session.apply(event);

        assert_eq!(session, once);
    }

    #[test]
    fn host_transfer_away_demotes_the_local_user() {
        let mut session = session_in_room("u1");
        session.ready_progress = Some((1, 2));

        let effects = session.apply(RoomEvent::HostTransferred {
            new_host_id: "u2".to_string(),
            room: snapshot("r1", &[("u2", "Bob"), ("u1", "Alice")]),
        });

        assert!(effects.is_empty());
        assert_eq!(session.role, Role::Joiner);
        assert_eq!(session.ready_progress, None);
    }

    #[test]
    fn disappearing_from_the_snapshot_clears_the_session() {
        let mut session = session_in_room("u2");

        let effects = session.apply(RoomEvent::UserLeft {
            user_id: "u2".to_string(),
            room: snapshot("r1", &[("u1", "Alice")]),
        });

        assert_eq!(effects, vec![Effect::SessionCleared]);
        assert!(!session.in_room());
        assert!(session.snapshot.is_none());
        assert_eq!(session.role, Role::None);
    }

    #[test]
    fn sync_request_updates_playback_and_aligns() {
        let mut session = session_in_room("u2");

        let track = crate::Track {
            id: "t1".to_string(),
            name: "Windowlicker".to_string(),
            artists: vec!["Aphex Twin".to_string()],
            uri: "spotify:track:t1".to_string(),
        };

        let effects = session.apply(RoomEvent::SyncRequested {
            current_track: Some(track.clone()),
            position_ms: 32_000,
            is_playing: true,
        });

        assert_eq!(
            effects,
            vec![Effect::AlignPlayback {
                track: Some(track.clone()),
                position_ms: 32_000,
                is_playing: true,
            }]
        );

        let snapshot = session.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.current_track, Some(track));
        assert_eq!(snapshot.position_ms, 32_000);
        assert!(snapshot.is_playing);
        // Membership is untouched by a sync.
        assert_eq!(snapshot.participants.len(), 2);
    }

    #[test]
    fn all_ready_clears_flags_and_starts_playback() {
        let mut session = session_in_room("u2");
        session.is_ready = true;
        session.ready_progress = Some((2, 2));

        if let Some(snapshot) = session.snapshot.as_mut() {
            for participant in snapshot.participants.values_mut() {
                participant.is_ready = true;
            }
        }

        let effects = session.apply(RoomEvent::AllReady {
            current_track: None,
            position_ms: 0,
            is_playing: true,
        });

        assert_eq!(effects, vec![Effect::BeginPlayback]);
        assert!(!session.is_ready);
        assert_eq!(session.ready_progress, None);

        let snapshot = session.snapshot.as_ref().unwrap();
        assert!(snapshot.participants.values().all(|p| !p.is_ready));
    }

    #[test]
    fn all_ready_without_playback_does_not_start_anything() {
        let mut session = session_in_room("u2");

        let effects = session.apply(RoomEvent::AllReady {
            current_track: None,
            position_ms: 0,
            is_playing: false,
        });

        assert!(effects.is_empty());
    }

    #[test]
    fn room_deletion_is_terminal() {
        let mut session = session_in_room("u1");

        let effects = session.apply(RoomEvent::RoomDeleted);
        assert_eq!(effects, vec![Effect::SessionCleared]);
        assert!(!session.in_room());

        // Stale events for the dead room must not resurrect it.
        let effects = session.apply(RoomEvent::UserJoined {
            room: snapshot("r1", &[("u1", "Alice"), ("u2", "Bob")]),
        });

        assert!(effects.is_empty());
        assert!(session.snapshot.is_none());
    }

    #[test]
    fn events_without_a_room_are_ignored() {
        let mut session = LocalSession {
            user_id: Some("u1".to_string()),
            ..Default::default()
        };

        let effects = session.apply(RoomEvent::SyncRequested {
            current_track: None,
            position_ms: 5_000,
            is_playing: true,
        });

        assert!(effects.is_empty());
        assert_eq!(session, LocalSession {
            user_id: Some("u1".to_string()),
            ..Default::default()
        });
    }
}

mod file;
mod memory;

pub use file::*;
pub use memory::*;

use auxparty_core::{LocalSession, Role, RoomId, RoomSnapshot, UserId};
use log::warn;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The keys a session persists. Absence of any key is a valid state.
pub mod keys {
    pub const ROOM_ID: &str = "room_id";
    pub const ROOM: &str = "room";
    pub const ROLE: &str = "role";
    pub const AUTH_TOKEN: &str = "auth_token";
    pub const USER_ID: &str = "user_id";

    pub const ALL: [&str; 5] = [ROOM_ID, ROOM, ROLE, AUTH_TOKEN, USER_ID];
}

/// A durable last-write-wins key/value store backing session resumption.
pub trait StateStore: Send + Sync + 'static {
    fn save(&self, key: &str, value: &str) -> StoreResult<()>;
    fn load(&self, key: &str) -> StoreResult<Option<String>>;
    fn clear(&self, key: &str) -> StoreResult<()>;
}

impl<S> StateStore for std::sync::Arc<S>
where
    S: StateStore,
{
    fn save(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).save(key, value)
    }

    fn load(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).load(key)
    }

    fn clear(&self, key: &str) -> StoreResult<()> {
        (**self).clear(key)
    }
}

/// A resumable session as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSession {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub role: Role,
    pub snapshot: RoomSnapshot,
    pub auth_token: Option<String>,
}

/// Typed persistence layer over a [`StateStore`].
pub struct SessionStore<S> {
    store: S,
}

impl<S> SessionStore<S>
where
    S: StateStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persists the resumable parts of the session. A session without a
    /// room clears the stored one instead.
    pub fn save(&self, session: &LocalSession) -> StoreResult<()> {
        let (room_id, snapshot, user_id) = match (
            session.room_id.as_ref(),
            session.snapshot.as_ref(),
            session.user_id.as_ref(),
        ) {
            (Some(room_id), Some(snapshot), Some(user_id)) => (room_id, snapshot, user_id),
            _ => return self.clear(),
        };

        self.store.save(keys::ROOM_ID, room_id)?;
        self.store.save(keys::ROOM, &serde_json::to_string(snapshot)?)?;
        self.store
            .save(keys::ROLE, &serde_json::to_string(&session.role)?)?;
        self.store.save(keys::USER_ID, user_id)?;

        match session.auth_token.as_ref() {
            Some(token) => self.store.save(keys::AUTH_TOKEN, token)?,
            None => self.store.clear(keys::AUTH_TOKEN)?,
        }

        Ok(())
    }

    /// Loads a previously persisted session.
    ///
    /// Stored data is untrusted. A missing or unparseable entry clears every
    /// session key and reads back as a fresh session, never as a partial one.
    pub fn load(&self) -> StoreResult<Option<PersistedSession>> {
        let room_id = self.store.load(keys::ROOM_ID)?;
        let raw_snapshot = self.store.load(keys::ROOM)?;
        let raw_role = self.store.load(keys::ROLE)?;
        let user_id = self.store.load(keys::USER_ID)?;
        let auth_token = self.store.load(keys::AUTH_TOKEN)?;

        let any_present =
            room_id.is_some() || raw_snapshot.is_some() || raw_role.is_some() || user_id.is_some();

        let (room_id, raw_snapshot, raw_role, user_id) =
            match (room_id, raw_snapshot, raw_role, user_id) {
                (Some(room_id), Some(raw_snapshot), Some(raw_role), Some(user_id)) => {
                    (room_id, raw_snapshot, raw_role, user_id)
                }
                _ => {
                    if any_present {
                        warn!("Persisted session is incomplete, starting fresh");
                        self.clear()?;
                    }

                    return Ok(None);
                }
            };

        let Ok(snapshot) = serde_json::from_str::<RoomSnapshot>(&raw_snapshot) else {
            warn!("Persisted room snapshot is corrupt, starting fresh");
            self.clear()?;
            return Ok(None);
        };

        let Ok(role) = serde_json::from_str::<Role>(&raw_role) else {
            warn!("Persisted role is corrupt, starting fresh");
            self.clear()?;
            return Ok(None);
        };

        Ok(Some(PersistedSession {
            user_id,
            room_id,
            role,
            snapshot: snapshot.normalize(),
            auth_token,
        }))
    }

    /// Removes every persisted session key.
    pub fn clear(&self) -> StoreResult<()> {
        for key in keys::ALL {
            self.store.clear(key)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use auxparty_core::{LocalSession, Participant, Role, RoomSnapshot};

    use super::{keys, MemoryStore, SessionStore, StateStore};

    fn session_with_room() -> LocalSession {
        let mut participants = std::collections::BTreeMap::new();
        participants.insert(
            "u1".to_string(),
            Participant {
                user_id: "u1".to_string(),
                name: "Alice".to_string(),
                is_host: true,
                is_ready: false,
            },
        );

        LocalSession {
            user_id: Some("u1".to_string()),
            display_name: Some("Alice".to_string()),
            room_id: Some("r1".to_string()),
            role: Role::Host,
            auth_token: Some("token".to_string()),
            snapshot: Some(RoomSnapshot {
                room_id: "r1".to_string(),
                participants,
                current_track: None,
                position_ms: 0,
                is_playing: false,
                joiners_ready: Vec::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn round_trips_a_session() {
        let store = SessionStore::new(MemoryStore::new());
        let session = session_with_room();

        store.save(&session).unwrap();
        let persisted = store.load().unwrap().unwrap();

        assert_eq!(persisted.user_id, "u1");
        assert_eq!(persisted.room_id, "r1");
        assert_eq!(persisted.role, Role::Host);
        assert_eq!(persisted.snapshot, session.snapshot.unwrap());
        assert_eq!(persisted.auth_token, Some("token".to_string()));
    }

    #[test]
    fn corrupt_snapshot_clears_everything() {
        let memory = MemoryStore::new();
        let store = SessionStore::new(memory);

        store.save(&session_with_room()).unwrap();
        store.store.save(keys::ROOM, "{not json").unwrap();

        assert!(store.load().unwrap().is_none());

        for key in keys::ALL {
            assert!(store.store.load(key).unwrap().is_none());
        }
    }

    #[test]
    fn incomplete_session_clears_everything() {
        let store = SessionStore::new(MemoryStore::new());

        store.save(&session_with_room()).unwrap();
        store.store.clear(keys::ROLE).unwrap();

        assert!(store.load().unwrap().is_none());
        assert!(store.store.load(keys::ROOM_ID).unwrap().is_none());
    }

    #[test]
    fn empty_store_reads_as_a_fresh_session() {
        let store = SessionStore::new(MemoryStore::new());

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn saving_a_roomless_session_clears_the_stored_one() {
        let store = SessionStore::new(MemoryStore::new());

        store.save(&session_with_room()).unwrap();
        store.save(&LocalSession::default()).unwrap();

        assert!(store.load().unwrap().is_none());
    }
}

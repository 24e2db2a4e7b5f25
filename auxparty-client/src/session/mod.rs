use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use auxparty_core::{
    derive_role, Effect, LocalSession, Role, RoomEvent, RoomId, RoomSnapshot, UserId,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    api::{ApiError, NewRoomRequest, RoomApi, RoomResponse},
    events::{SessionEvent, SessionEventReceiver, SessionEventSender},
    gateway::{Gateway, GatewayConfig, GatewayEvent, GatewayState, Transport},
    persist::{SessionStore, StateStore},
    player::{PlaybackProvider, PlaybackState},
    util::generate_user_id,
};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected locally, before any network call.
    #[error("Please enter your name")]
    EmptyDisplayName,
    /// Rejected locally, before any network call.
    #[error("Please enter a room id")]
    EmptyRoomId,
    /// Transfer host with nobody to transfer to.
    #[error("No other users to transfer host to")]
    NoOtherUsers,
    /// The server or the network rejected the request.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the external playback status is polled while in a room.
    pub poll_interval: Duration,
    pub gateway: GatewayConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            gateway: GatewayConfig::default(),
        }
    }
}

/// A collaborative listening session.
///
/// Owns the local session state and orchestrates the lifecycle api, the
/// event gateway, the persistence store, and the playback provider, all of
/// which are injected. One host controls playback; joiners follow along and
/// take part in the ready consensus.
pub struct Session<A, S, P> {
    context: Arc<SessionContext<A, S, P>>,
    dispatch_task: JoinHandle<()>,
}

/// State shared between the session handle, the dispatch task, and the
/// playback poll task.
struct SessionContext<A, S, P> {
    api: A,
    store: SessionStore<S>,
    player: P,
    gateway: Gateway,
    state: Mutex<LocalSession>,
    events: SessionEventSender,
    /// Playback poll task for the current room, if one is running.
    poll_task: Mutex<Option<JoinHandle<()>>>,
    /// How many gateway connections the dispatch loop has handled. Compared
    /// against [`Gateway::connections`] to keep membership announcements at
    /// exactly one per connection.
    seen_connections: AtomicU64,
    config: SessionConfig,
}

impl<A, S, P> Session<A, S, P>
where
    A: RoomApi,
    S: StateStore,
    P: PlaybackProvider,
{
    /// Starts a session: restores any persisted room, opens the event
    /// gateway over the given transport, and begins dispatching.
    ///
    /// A restored room is rendered immediately and re-validated only by the
    /// next authoritative event; there is no existence probe.
    pub fn start<T>(
        config: SessionConfig,
        api: A,
        store: SessionStore<S>,
        player: P,
        transport: T,
    ) -> (Self, SessionEventReceiver)
    where
        T: Transport,
    {
        let (events, event_receiver) = mpsc::unbounded_channel();

        let mut initial = LocalSession::default();

        match store.load() {
            Ok(Some(persisted)) => {
                let role = derive_role(&persisted.user_id, &persisted.snapshot);

                if role == Role::None {
                    warn!("Persisted session no longer includes this user, starting fresh");

                    if let Err(err) = store.clear() {
                        warn!("Failed to clear persisted session: {err}");
                    }
                } else {
                    if role != persisted.role {
                        warn!("Persisted role disagrees with the snapshot, using the derived one");
                    }

                    info!("Resuming session for room {}", persisted.room_id);

                    initial.user_id = Some(persisted.user_id);
                    initial.room_id = Some(persisted.room_id);
                    initial.role = role;
                    initial.auth_token = persisted.auth_token;
                    initial.snapshot = Some(persisted.snapshot);
                }
            }
            Ok(None) => {}
            Err(err) => warn!("Failed to read persisted session: {err}"),
        }

        let (gateway, gateway_receiver) = Gateway::connect(transport, config.gateway.clone());

        let context = Arc::new(SessionContext {
            api,
            store,
            player,
            gateway,
            state: Mutex::new(initial),
            events,
            poll_task: Mutex::new(None),
            seen_connections: AtomicU64::new(0),
            config,
        });

        let resumed = {
            let state = context.state.lock();
            state
                .snapshot
                .clone()
                .map(|snapshot| (snapshot, state.role))
        };

        if let Some((snapshot, role)) = resumed {
            start_poll(&context);
            context.emit(SessionEvent::RoomUpdated { snapshot, role });
        }

        let dispatch_task = tokio::spawn(dispatch_loop(context.clone(), gateway_receiver));

        (
            Self {
                context,
                dispatch_task,
            },
            event_receiver,
        )
    }

    /// Creates a new room and becomes its host.
    pub async fn create_room(&self, display_name: &str) -> SessionResult<RoomSnapshot> {
        let display_name = display_name.trim();

        if display_name.is_empty() {
            return Err(SessionError::EmptyDisplayName);
        }

        let (user_id, auth_token) = self.context.identity();

        let response = self
            .context
            .api
            .create_room(NewRoomRequest {
                user_id: user_id.clone(),
                user_name: display_name.to_string(),
                spotify_token: auth_token,
            })
            .await?;

        let snapshot = self.context.enter_room(user_id, display_name, response);
        start_poll(&self.context);

        Ok(snapshot)
    }

    /// Joins an existing room as a joiner.
    pub async fn join_room(&self, room_id: &str, display_name: &str) -> SessionResult<RoomSnapshot> {
        let room_id = room_id.trim();
        let display_name = display_name.trim();

        if room_id.is_empty() {
            return Err(SessionError::EmptyRoomId);
        }

        if display_name.is_empty() {
            return Err(SessionError::EmptyDisplayName);
        }

        let (user_id, auth_token) = self.context.identity();

        let response = self
            .context
            .api
            .join_room(
                room_id,
                NewRoomRequest {
                    user_id: user_id.clone(),
                    user_name: display_name.to_string(),
                    spotify_token: auth_token,
                },
            )
            .await?;

        let snapshot = self.context.enter_room(user_id, display_name, response);
        start_poll(&self.context);

        Ok(snapshot)
    }

    /// Leaves the current room, or does nothing outside one.
    ///
    /// Local cleanup always happens, even when the server can't be reached:
    /// staying in a half-left room is worse than the server finding out
    /// later through the dropped connection.
    pub async fn leave_room(&self) -> SessionResult<()> {
        let (room_id, user_id) = {
            let state = self.context.state.lock();

            match state.room_id.clone() {
                Some(room_id) => (room_id, state.user_id.clone()),
                None => return Ok(()),
            }
        };

        if let Some(user_id) = user_id {
            if let Err(err) = self.context.api.leave_room(&room_id, &user_id).await {
                warn!("Leave request failed, clearing local state anyway: {err}");
            }
        }

        self.context.gateway.leave_room(&room_id);
        self.context.stop_poll();

        {
            let mut state = self.context.state.lock();
            state.clear_room();
        }

        self.context.clear_store();
        self.context.emit(SessionEvent::RoomClosed);

        Ok(())
    }

    /// Asks the server to broadcast the host's playback for everyone to
    /// align to. A no-op for non-hosts and outside a room.
    pub async fn request_sync(&self) -> SessionResult<()> {
        let room_id = {
            let state = self.context.state.lock();

            match (state.role, state.room_id.clone()) {
                (Role::Host, Some(room_id)) => room_id,
                _ => return Ok(()),
            }
        };

        self.context.api.request_sync(&room_id).await?;

        Ok(())
    }

    /// Hands the host role to the first non-host participant.
    ///
    /// The target is fixed, not chosen: whoever comes first in participant
    /// order. The role change lands through the `host_transferred` event.
    pub async fn transfer_host(&self) -> SessionResult<()> {
        let (room_id, target) = {
            let state = self.context.state.lock();

            let Some(room_id) = state.room_id.clone() else {
                return Ok(());
            };

            if state.role != Role::Host {
                return Ok(());
            }

            let target = state
                .snapshot
                .as_ref()
                .and_then(|snapshot| snapshot.first_joiner())
                .map(|participant| participant.user_id.clone())
                .ok_or(SessionError::NoOtherUsers)?;

            (room_id, target)
        };

        self.context.api.transfer_host(&room_id, &target).await?;

        Ok(())
    }

    /// Signals readiness for a synchronized start. Once marked, repeated
    /// calls do nothing until the flag is cleared by `all_ready`.
    pub async fn mark_ready(&self) -> SessionResult<()> {
        let (room_id, user_id) = {
            let mut state = self.context.state.lock();

            let (Some(room_id), Some(user_id)) = (state.room_id.clone(), state.user_id.clone())
            else {
                return Ok(());
            };

            if state.is_ready {
                return Ok(());
            }

            // Optimistic: the flag flips locally before the server confirms.
            state.is_ready = true;

            if let Some(local) = state
                .snapshot
                .as_mut()
                .and_then(|snapshot| snapshot.participants.get_mut(&user_id))
            {
                local.is_ready = true;
            }

            (room_id, user_id)
        };

        match self.context.api.mark_ready(&room_id, &user_id).await {
            Ok(response) => {
                {
                    let mut state = self.context.state.lock();
                    state.ready_progress =
                        Some((response.joiners_ready, response.total_joiners));
                    self.context.persist(&state);
                }

                self.context.emit(SessionEvent::ReadyProgress {
                    joiners_ready: response.joiners_ready,
                    total_joiners: response.total_joiners,
                });

                Ok(())
            }
            Err(err) => {
                // Roll the optimistic flag back so the user can retry.
                let mut state = self.context.state.lock();
                state.is_ready = false;

                if let Some(local) = state
                    .snapshot
                    .as_mut()
                    .and_then(|snapshot| snapshot.participants.get_mut(&user_id))
                {
                    local.is_ready = false;
                }

                Err(err.into())
            }
        }
    }

    /// Stores the playback provider credential for subsequent requests.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        let mut state = self.context.state.lock();
        state.auth_token = Some(token.into());
        self.context.persist(&state);
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.context.state.lock().user_id.clone()
    }

    pub fn display_name(&self) -> Option<String> {
        self.context.state.lock().display_name.clone()
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.context.state.lock().room_id.clone()
    }

    pub fn role(&self) -> Role {
        self.context.state.lock().role
    }

    pub fn snapshot(&self) -> Option<RoomSnapshot> {
        self.context.state.lock().snapshot.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.context.state.lock().is_ready
    }

    pub fn ready_progress(&self) -> Option<(u32, u32)> {
        self.context.state.lock().ready_progress
    }

    pub fn connection_state(&self) -> GatewayState {
        self.context.gateway.state()
    }
}

impl<A, S, P> Drop for Session<A, S, P> {
    fn drop(&mut self) {
        self.dispatch_task.abort();

        if let Some(task) = self.context.poll_task.lock().take() {
            task.abort();
        }
    }
}

impl<A, S, P> SessionContext<A, S, P>
where
    A: RoomApi,
    S: StateStore,
    P: PlaybackProvider,
{
    /// The id and credential to identify as, reusing the restored identity
    /// when one exists.
    fn identity(&self) -> (UserId, Option<String>) {
        let state = self.state.lock();

        (
            state.user_id.clone().unwrap_or_else(generate_user_id),
            state.auth_token.clone(),
        )
    }

    /// Installs a server-confirmed room as the current one.
    fn enter_room(
        &self,
        user_id: UserId,
        display_name: &str,
        response: RoomResponse,
    ) -> RoomSnapshot {
        let RoomResponse { room_id, room } = response;
        let room = room.normalize();

        let role = {
            let mut state = self.state.lock();
            state.user_id = Some(user_id);
            state.display_name = Some(display_name.to_string());
            state.replace_snapshot(room.clone());
            self.persist(&state);
            state.role
        };

        info!("Entered room {room_id} as {role:?}");

        // The dispatch loop announces membership whenever a connection is
        // established. It only needs help here if it has already handled the
        // current connection, before this room existed.
        let caught_up = self.seen_connections.load(Ordering::Acquire) == self.gateway.connections();

        if caught_up && self.gateway.state() == GatewayState::Connected {
            self.gateway.join_room(&room_id);
        }

        self.emit(SessionEvent::RoomUpdated {
            snapshot: room.clone(),
            role,
        });

        room
    }

    /// Applies one inbound room event and carries out whatever it asks for.
    async fn handle_room_event(&self, event: RoomEvent) {
        if let RoomEvent::UserLeft { user_id, .. } = &event {
            info!("User {user_id} left the room");
        }

        let (effects, update, sync_requested) = {
            let mut state = self.state.lock();

            if !state.in_room() {
                debug!("Dropping event for a room this session is no longer in");
                return;
            }

            let sync_requested = matches!(event, RoomEvent::SyncRequested { .. });
            let effects = state.apply(event);

            if state.in_room() {
                self.persist(&state);
            }

            let update = state
                .snapshot
                .clone()
                .map(|snapshot| (snapshot, state.role));

            (effects, update, sync_requested)
        };

        if sync_requested {
            self.emit(SessionEvent::SyncRequested);
        }

        if let Some((snapshot, role)) = update {
            self.emit(SessionEvent::RoomUpdated { snapshot, role });
        }

        for effect in effects {
            self.run_effect(effect).await;
        }
    }

    async fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::AlignPlayback {
                track,
                position_ms,
                is_playing,
            } => {
                let Some(track) = track else {
                    return;
                };

                if let Err(err) = self.player.play(&track.uri, position_ms).await {
                    warn!("Failed to align playback: {err}");
                    return;
                }

                if !is_playing {
                    if let Err(err) = self.player.pause().await {
                        warn!("Failed to pause after aligning: {err}");
                    }
                }
            }
            Effect::BeginPlayback => {
                if let Err(err) = self.player.resume().await {
                    warn!("Failed to start playback: {err}");
                }
            }
            Effect::SessionCleared => {
                self.stop_poll();
                self.clear_store();
                self.emit(SessionEvent::RoomClosed);
            }
        }
    }

    /// Merges a polled playback state into the snapshot. Whichever of the
    /// poll and the push stream wrote last wins.
    fn apply_playback(&self, playback: PlaybackState) {
        let update = {
            let mut state = self.state.lock();
            let role = state.role;

            let Some(snapshot) = state.snapshot.as_mut() else {
                return;
            };

            let changed = snapshot.current_track != playback.track
                || snapshot.position_ms != playback.position_ms
                || snapshot.is_playing != playback.is_playing;

            if !changed {
                return;
            }

            snapshot.current_track = playback.track;
            snapshot.position_ms = playback.position_ms;
            snapshot.is_playing = playback.is_playing;

            (snapshot.clone(), role)
        };

        self.emit(SessionEvent::RoomUpdated {
            snapshot: update.0,
            role: update.1,
        });
    }

    fn persist(&self, state: &LocalSession) {
        if let Err(err) = self.store.save(state) {
            warn!("Failed to persist session: {err}");
        }
    }

    fn clear_store(&self) {
        if let Err(err) = self.store.clear() {
            warn!("Failed to clear persisted session: {err}");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine; these are advisory.
        let _ = self.events.send(event);
    }

    fn stop_poll(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}

/// Starts the playback poll for the current room, unless one is already
/// running.
fn start_poll<A, S, P>(context: &Arc<SessionContext<A, S, P>>)
where
    A: RoomApi,
    S: StateStore,
    P: PlaybackProvider,
{
    let mut slot = context.poll_task.lock();

    if slot.is_some() {
        return;
    }

    *slot = Some(tokio::spawn(poll_loop(context.clone())));
}

async fn dispatch_loop<A, S, P>(
    context: Arc<SessionContext<A, S, P>>,
    mut gateway_receiver: mpsc::UnboundedReceiver<GatewayEvent>,
) where
    A: RoomApi,
    S: StateStore,
    P: PlaybackProvider,
{
    while let Some(event) = gateway_receiver.recv().await {
        match event {
            GatewayEvent::Connected => {
                context.seen_connections.fetch_add(1, Ordering::AcqRel);

                // The server forgets transport-level membership between
                // connections, so it has to be announced on every one.
                let room_id = context.state.lock().room_id.clone();

                if let Some(room_id) = room_id {
                    info!("Announcing membership for room {room_id}");
                    context.gateway.join_room(&room_id);
                }
            }
            GatewayEvent::Disconnected => {
                debug!("Event channel dropped, waiting for the gateway to redial");
            }
            GatewayEvent::ConnectionLost => {
                warn!("Event channel lost for good, a restart is required");
                context.emit(SessionEvent::ConnectionLost);
            }
            GatewayEvent::Room(event) => context.handle_room_event(event).await,
        }
    }
}

async fn poll_loop<A, S, P>(context: Arc<SessionContext<A, S, P>>)
where
    A: RoomApi,
    S: StateStore,
    P: PlaybackProvider,
{
    let mut ticker = tokio::time::interval(context.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match context.player.current_playback().await {
            Ok(Some(playback)) => context.apply_playback(playback),
            Ok(None) => {}
            Err(err) => warn!("Playback poll failed: {err}"),
        }
    }
}

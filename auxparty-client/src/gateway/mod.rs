mod transport;
mod ws;

pub use transport::*;
pub use ws::*;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use auxparty_core::RoomEvent;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};

/// How the gateway redials after a dropped connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Delay before the first retry. Doubles per consecutive failure.
    pub min_backoff: Duration,
    /// Ceiling for the retry delay.
    pub max_backoff: Duration,
    /// Consecutive failed attempts before the connection is declared lost.
    pub max_attempts: u32,
    /// Time budget for a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
            max_attempts: 8,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// The delay before retry number `failures`, starting at 1.
    fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));

        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Connection lifecycle and room events, interleaved in arrival order.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A connection is established. Emitted for the first connect and every
    /// reconnect; the server forgets membership between connections, so it
    /// must be re-announced on each of these.
    Connected,
    /// The connection dropped. The gateway is redialling.
    Disconnected,
    /// Retries are exhausted. Terminal: the gateway will not redial.
    ConnectionLost,
    /// A push event for the current room.
    Room(RoomEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Connected,
    ConnectionLost,
}

/// An outbound frame, mirroring the inbound `{event, data}` shape.
#[derive(Debug, Clone, Serialize)]
struct OutgoingFrame {
    event: String,
    data: serde_json::Value,
}

/// Maintains the one logical connection to the room event service.
///
/// Redials with bounded backoff when a connection drops and turns inbound
/// frames into [`GatewayEvent`]s. Outbound frames are fire-and-forget:
/// anything queued while disconnected is discarded, since membership gets
/// re-announced on every connect anyway.
pub struct Gateway {
    outgoing: mpsc::UnboundedSender<OutgoingFrame>,
    state: Arc<Mutex<GatewayState>>,
    connections: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Gateway {
    /// Spawns the connection loop over the given transport.
    pub fn connect<T>(transport: T, config: GatewayConfig) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>)
    where
        T: Transport,
    {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(GatewayState::Disconnected));
        let connections = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(connection_loop(
            transport,
            config,
            outgoing_receiver,
            event_sender,
            state.clone(),
            connections.clone(),
        ));

        (
            Self {
                outgoing,
                state,
                connections,
                task,
            },
            event_receiver,
        )
    }

    /// Sends a named event with a payload. Fire-and-forget, no ack.
    pub fn emit(&self, event: impl Into<String>, data: serde_json::Value) {
        let _ = self.outgoing.send(OutgoingFrame {
            event: event.into(),
            data,
        });
    }

    /// Announces membership of a room on the current connection.
    pub fn join_room(&self, room_id: &str) {
        self.emit("join_room", json!({ "room_id": room_id }));
    }

    /// Withdraws from a room's event feed.
    pub fn leave_room(&self, room_id: &str) {
        self.emit("leave_room", json!({ "room_id": room_id }));
    }

    pub fn state(&self) -> GatewayState {
        *self.state.lock()
    }

    /// How many connections have been established so far. Each one comes
    /// with exactly one [`GatewayEvent::Connected`], counted before the
    /// event is emitted.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connection_loop<T>(
    transport: T,
    config: GatewayConfig,
    mut outgoing: mpsc::UnboundedReceiver<OutgoingFrame>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    state: Arc<Mutex<GatewayState>>,
    connections: Arc<AtomicU64>,
) where
    T: Transport,
{
    let mut failures = 0u32;

    loop {
        let mut connection = loop {
            *state.lock() = GatewayState::Connecting;

            match timeout(config.connect_timeout, transport.connect()).await {
                Ok(Ok(connection)) => break connection,
                Ok(Err(err)) => warn!("Connect attempt failed: {err}"),
                Err(_) => warn!(
                    "Connect attempt timed out after {:?}",
                    config.connect_timeout
                ),
            }

            failures += 1;

            if failures >= config.max_attempts {
                *state.lock() = GatewayState::ConnectionLost;
                let _ = events.send(GatewayEvent::ConnectionLost);
                return;
            }

            tokio::time::sleep(config.backoff_delay(failures)).await;
        };

        failures = 0;

        // Frames queued while disconnected are stale by now.
        while outgoing.try_recv().is_ok() {}

        connections.fetch_add(1, Ordering::AcqRel);
        *state.lock() = GatewayState::Connected;

        if events.send(GatewayEvent::Connected).is_err() {
            return;
        }

        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => match serde_json::to_string(&frame) {
                        Ok(encoded) => {
                            if let Err(err) = connection.send(encoded).await {
                                warn!("Send failed, redialling: {err}");
                                break;
                            }
                        }
                        Err(err) => warn!("Dropping unencodable frame: {err}"),
                    },
                    // The gateway handle is gone.
                    None => return,
                },
                inbound = connection.recv() => match inbound {
                    Some(Ok(text)) => handle_frame(&events, &text),
                    Some(Err(err)) => {
                        warn!("Connection dropped: {err}");
                        break;
                    }
                    None => {
                        debug!("Connection closed by the server");
                        break;
                    }
                },
            }
        }

        *state.lock() = GatewayState::Disconnected;

        if events.send(GatewayEvent::Disconnected).is_err() {
            return;
        }
    }
}

fn handle_frame(events: &mpsc::UnboundedSender<GatewayEvent>, text: &str) {
    match serde_json::from_str::<RoomEvent>(text) {
        Ok(event) => {
            let _ = events.send(GatewayEvent::Room(event));
        }
        // A frame that doesn't match the known event set must never fault
        // the session; it is dropped here.
        Err(err) => warn!("Ignoring unrecognized event frame: {err}"),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::VecDeque,
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{
        Connection, Gateway, GatewayConfig, GatewayEvent, GatewayState, Transport,
        TransportError, TransportResult,
    };

    /// Hands out scripted connections, failing once the script runs dry.
    pub(crate) struct ScriptedTransport {
        connections: Mutex<VecDeque<ScriptedConnection>>,
    }

    pub(crate) struct ScriptedConnection {
        incoming: mpsc::UnboundedReceiver<Option<String>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    /// Feeds one scripted connection. Sending `None` closes it.
    pub(crate) type ConnectionScript = mpsc::UnboundedSender<Option<String>>;

    pub(crate) fn scripted_transport(
        count: usize,
    ) -> (ScriptedTransport, Vec<ConnectionScript>, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut scripts = Vec::new();
        let mut connections = VecDeque::new();

        for _ in 0..count {
            let (script, incoming) = mpsc::unbounded_channel();

            scripts.push(script);
            connections.push_back(ScriptedConnection {
                incoming,
                sent: sent.clone(),
            });
        }

        (
            ScriptedTransport {
                connections: Mutex::new(connections),
            },
            scripts,
            sent,
        )
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Conn = ScriptedConnection;

        async fn connect(&self) -> TransportResult<Self::Conn> {
            self.connections
                .lock()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("no server".to_string()))
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&mut self, frame: String) -> TransportResult<()> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<TransportResult<String>> {
            match self.incoming.recv().await {
                Some(Some(text)) => Some(Ok(text)),
                _ => None,
            }
        }
    }

    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        panic!("condition was never met");
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            max_attempts: 3,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_delivers_room_events() {
        let (transport, scripts, _sent) = scripted_transport(1);
        let (_gateway, mut events) = Gateway::connect(transport, test_config());

        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Connected)
        ));

        scripts[0]
            .send(Some(r#"{ "event": "room_deleted" }"#.to_string()))
            .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Room(auxparty_core::RoomEvent::RoomDeleted))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_skipped() {
        let (transport, scripts, _sent) = scripted_transport(1);
        let (_gateway, mut events) = Gateway::connect(transport, test_config());

        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Connected)
        ));

        scripts[0].send(Some("{ garbage".to_string())).unwrap();
        scripts[0]
            .send(Some(r#"{ "event": "not_a_thing", "data": {} }"#.to_string()))
            .unwrap();
        scripts[0]
            .send(Some(r#"{ "event": "room_deleted" }"#.to_string()))
            .unwrap();

        // Only the valid frame comes through.
        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Room(auxparty_core::RoomEvent::RoomDeleted))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_a_drop() {
        let (transport, scripts, sent) = scripted_transport(2);
        let (gateway, mut events) = Gateway::connect(transport, test_config());

        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Connected)
        ));

        scripts[0].send(None).unwrap();

        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Disconnected)
        ));
        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::Connected)
        ));
        assert_eq!(gateway.state(), GatewayState::Connected);

        // The fresh connection still carries frames.
        gateway.join_room("r1");

        wait_until(|| !sent.lock().is_empty()).await;

        let frames = sent.lock().clone();
        assert_eq!(frames.len(), 1);

        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["event"], "join_room");
        assert_eq!(frame["data"]["room_id"], "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_attempt_limit() {
        let (transport, _scripts, _sent) = scripted_transport(0);
        let (gateway, mut events) = Gateway::connect(transport, test_config());

        assert!(matches!(
            events.recv().await,
            Some(GatewayEvent::ConnectionLost)
        ));
        assert_eq!(gateway.state(), GatewayState::ConnectionLost);

        // Terminal: the loop is done, the channel closes.
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let config = GatewayConfig {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            max_attempts: 10,
            connect_timeout: Duration::from_secs(1),
        };

        assert_eq!(config.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(3));
        assert_eq!(config.backoff_delay(9), Duration::from_secs(3));
    }
}

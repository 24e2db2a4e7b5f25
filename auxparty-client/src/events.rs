use auxparty_core::{Role, RoomSnapshot};
use tokio::sync::mpsc;

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Events surfaced to the presentation layer.
///
/// These are advisory: a session works fine with nobody listening.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The room snapshot was replaced, or playback display fields changed.
    RoomUpdated { snapshot: RoomSnapshot, role: Role },
    /// The host asked everyone to get ready for a synchronized start.
    SyncRequested,
    /// The ready consensus display value changed.
    ReadyProgress {
        joiners_ready: u32,
        total_joiners: u32,
    },
    /// The local session left the room, or the room was deleted.
    RoomClosed,
    /// The event channel gave up reconnecting. The session cannot recover
    /// without a restart.
    ConnectionLost,
}

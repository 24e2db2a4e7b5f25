mod events;
mod room;
mod state;
mod track;

pub use events::*;
pub use room::*;
pub use state::*;
pub use track::*;

/// An opaque room identifier, issued by the server.
pub type RoomId = String;

/// An opaque user identifier, generated by the client.
pub type UserId = String;

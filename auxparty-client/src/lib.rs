mod api;
mod events;
mod gateway;
mod persist;
mod player;
mod session;
mod util;

pub mod logging;

pub use api::*;
pub use events::*;
pub use gateway::*;
pub use persist::*;
pub use player::*;
pub use session::*;
pub use util::*;

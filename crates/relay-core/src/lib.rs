pub mod events;
pub mod ids;

pub use events::{Event, EventType};
pub use ids::{EventId, RunId, SessionId};

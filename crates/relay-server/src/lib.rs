pub mod dispatch;
pub mod handlers;
pub mod live;
pub mod persist;
pub mod reaper;
pub mod usage;

pub use dispatch::{CommandHandler, CommandRegistry, CommandType, SessionContext};
pub use handlers::build_registry;
pub use live::LiveTransport;
pub use persist::EventPersister;
pub use reaper::{ReaperConfig, RunReaper, SweepReport};
pub use usage::{ModelRates, UsageMeter};

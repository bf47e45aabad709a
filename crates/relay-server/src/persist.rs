//! Subscriber that persists delivered events to the session event log.

use async_trait::async_trait;

use relay_bus::Subscriber;
use relay_core::events::{Event, EventType};
use relay_store::events::EventLogRepo;
use relay_store::Database;

/// Appends every delivered event to the store. Termination notices are
/// skipped — the reaper already wrote them in the same transaction as the
/// status flip, and a second copy would fork the log.
pub struct EventPersister {
    log: EventLogRepo,
}

impl EventPersister {
    pub fn new(db: Database) -> Self {
        Self {
            log: EventLogRepo::new(db),
        }
    }
}

#[async_trait]
impl Subscriber for EventPersister {
    fn name(&self) -> &str {
        "event_persister"
    }

    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if event.event_type == EventType::RunInterrupted {
            return Ok(());
        }

        self.log.append(
            &event.session_id,
            event.run_id.as_ref(),
            event.event_type.as_str(),
            event.content,
        )?;
        Ok(())
    }
}

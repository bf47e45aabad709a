//! Command handlers for run lifecycle operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use relay_bus::{EventBus, LockFactory};
use relay_core::events::{Event, EventType};
use relay_store::runs::{CasOutcome, RunStatus, RunTaskRepo, RunTaskRow};
use relay_store::Database;

use crate::dispatch::{CommandHandler, CommandRegistry, CommandType, SessionContext};

const CANCEL_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_LOCK_NAMESPACE: &str = "run-cancel";

/// Build the registry with all run handlers wired to shared dependencies.
/// Called once per session/connection.
pub fn build_registry(db: Database, bus: Arc<EventBus>, locks: Arc<LockFactory>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(StartRunHandler {
        runs: RunTaskRepo::new(db.clone()),
        bus: Arc::clone(&bus),
    }));
    registry.register(Arc::new(CancelRunHandler {
        runs: RunTaskRepo::new(db.clone()),
        bus: Arc::clone(&bus),
        locks,
    }));
    registry.register(Arc::new(RunStatusHandler {
        runs: RunTaskRepo::new(db),
        bus,
    }));
    registry
}

/// Status label as shown to users. ABORTED surfaces as CANCELLED — the
/// user asked for a cancellation, not an abort code.
fn user_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
        RunStatus::Aborted => "CANCELLED",
        RunStatus::SystemInterrupted => "SYSTEM_INTERRUPTED",
    }
}

/// Creates a RUNNING task for the session and announces it.
pub struct StartRunHandler {
    runs: RunTaskRepo,
    bus: Arc<EventBus>,
}

#[async_trait]
impl CommandHandler for StartRunHandler {
    fn command_type(&self) -> CommandType {
        CommandType::StartRun
    }

    async fn handle(&self, content: Value, session: &SessionContext) {
        match self.runs.find_running_by_session(&session.session_id) {
            Ok(Some(_)) => {
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "run_active",
                    "session already has a running task",
                ));
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "run lookup failed");
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "internal",
                    e.to_string(),
                ));
                return;
            }
        }

        let user_message_id = content.get("userMessageId").and_then(|v| v.as_str());
        match self.runs.create(&session.session_id, user_message_id) {
            Ok(task) => {
                info!(session_id = %session.session_id, run_id = %task.id, "run started");
                self.bus.publish(Event::for_run(
                    EventType::RunStarted,
                    session.session_id.clone(),
                    task.id,
                    json!({ "userMessageId": user_message_id }),
                ));
            }
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "run creation failed");
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "internal",
                    e.to_string(),
                ));
            }
        }
    }
}

/// Cancels the session's running task via a version-guarded CAS.
///
/// The per-session lock narrows the read-CAS window against other
/// cancellers in this or any other process; a concurrent natural
/// completion still surfaces as a distinct state_conflict instead of a
/// silent success, because cancelling an already-finished run is not a
/// retryable fault.
pub struct CancelRunHandler {
    runs: RunTaskRepo,
    bus: Arc<EventBus>,
    locks: Arc<LockFactory>,
}

impl CancelRunHandler {
    /// CAS step: flip the task read at lookup time to ABORTED, invalidate
    /// the gate's cached status, and announce the terminal state to the
    /// session.
    async fn finish_cancel(&self, task: RunTaskRow, session: &SessionContext) {
        match self.runs.update_status(&task.id, task.version, RunStatus::Aborted) {
            Ok(CasOutcome::Updated(row)) => {
                self.bus.gate().invalidate(&row.id);
                info!(session_id = %session.session_id, run_id = %row.id, "run cancelled");
                self.bus.publish(Event::for_session(
                    EventType::StatusUpdate,
                    session.session_id.clone(),
                    json!({
                        "runId": row.id,
                        "status": user_label(row.status),
                    }),
                ));
            }
            Ok(CasOutcome::Conflict) => {
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "state_conflict",
                    format!("task {} was updated concurrently", task.id),
                ));
            }
            Err(e) => {
                warn!(run_id = %task.id, error = %e, "cancel CAS failed");
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "internal",
                    e.to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl CommandHandler for CancelRunHandler {
    fn command_type(&self) -> CommandType {
        CommandType::CancelRun
    }

    async fn handle(&self, _content: Value, session: &SessionContext) {
        let _lock = match self
            .locks
            .acquire(
                CANCEL_LOCK_NAMESPACE,
                session.session_id.as_str(),
                CANCEL_LOCK_TIMEOUT,
            )
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "cancel lock unavailable");
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "internal",
                    e.to_string(),
                ));
                return;
            }
        };

        match self.runs.find_running_by_session(&session.session_id) {
            Ok(Some(task)) => self.finish_cancel(task, session).await,
            Ok(None) => {
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "no_running_task",
                    "no running task for session",
                ));
            }
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "run lookup failed");
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "internal",
                    e.to_string(),
                ));
            }
        }
    }
}

/// Reports the most recent task's status for the session.
pub struct RunStatusHandler {
    runs: RunTaskRepo,
    bus: Arc<EventBus>,
}

#[async_trait]
impl CommandHandler for RunStatusHandler {
    fn command_type(&self) -> CommandType {
        CommandType::RunStatus
    }

    async fn handle(&self, _content: Value, session: &SessionContext) {
        match self.runs.list_by_session(&session.session_id) {
            Ok(tasks) => match tasks.first() {
                Some(task) => {
                    self.bus.publish(Event::for_session(
                        EventType::StatusUpdate,
                        session.session_id.clone(),
                        json!({
                            "runId": task.id,
                            "status": user_label(task.status),
                            "version": task.version,
                        }),
                    ));
                }
                None => {
                    self.bus.publish(Event::error(
                        session.session_id.clone(),
                        "no_task",
                        "session has no tasks",
                    ));
                }
            },
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "task listing failed");
                self.bus.publish(Event::error(
                    session.session_id.clone(),
                    "internal",
                    e.to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use relay_bus::{RunGate, Subscriber};
    use relay_core::ids::SessionId;
    use std::time::Duration;

    struct Collector {
        events: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl Subscriber for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct Fixture {
        db: Database,
        bus: Arc<EventBus>,
        registry: CommandRegistry,
        events: Arc<Mutex<Vec<Event>>>,
        session: SessionContext,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let gate = Arc::new(RunGate::new(db.clone()));
        let bus = Arc::new(EventBus::new(gate));
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Arc::new(Collector {
            events: events.clone(),
        }));

        let locks = Arc::new(LockFactory::in_process());
        let registry = build_registry(db.clone(), Arc::clone(&bus), locks);

        Fixture {
            db,
            bus,
            registry,
            events,
            session: SessionContext::new(SessionId::new()),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn start_creates_running_task_and_publishes() {
        let fx = setup();
        fx.registry
            .dispatch(
                CommandType::StartRun,
                json!({"userMessageId": "msg_1"}),
                &fx.session,
            )
            .await;
        settle().await;

        let repo = RunTaskRepo::new(fx.db.clone());
        let task = repo
            .find_running_by_session(&fx.session.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(task.status, RunStatus::Running);
        assert_eq!(task.version, 0);
        assert_eq!(task.user_message_id.as_deref(), Some("msg_1"));

        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[0].run_id.as_ref().unwrap(), &task.id);
    }

    #[tokio::test]
    async fn start_refuses_second_concurrent_run() {
        let fx = setup();
        fx.registry
            .dispatch(CommandType::StartRun, json!({}), &fx.session)
            .await;
        fx.registry
            .dispatch(CommandType::StartRun, json!({}), &fx.session)
            .await;
        settle().await;

        let events = fx.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Error);
        assert_eq!(events[1].content["kind"], "run_active");
    }

    #[tokio::test]
    async fn cancel_running_task_publishes_cancelled_status() {
        let fx = setup();
        let repo = RunTaskRepo::new(fx.db.clone());
        let task = repo.create(&fx.session.session_id, None).unwrap();

        fx.registry
            .dispatch(CommandType::CancelRun, json!({}), &fx.session)
            .await;
        settle().await;

        let row = repo.get(&task.id).unwrap();
        assert_eq!(row.status, RunStatus::Aborted);
        assert_eq!(row.version, 1);

        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StatusUpdate);
        assert_eq!(events[0].content["status"], "CANCELLED");
        assert_eq!(events[0].content["runId"], task.id.as_str());
    }

    #[tokio::test]
    async fn cancel_without_running_task_publishes_error() {
        let fx = setup();
        fx.registry
            .dispatch(CommandType::CancelRun, json!({}), &fx.session)
            .await;
        settle().await;

        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].content["kind"], "no_running_task");
    }

    #[tokio::test]
    async fn cancel_losing_the_race_surfaces_state_conflict() {
        let fx = setup();
        let repo = RunTaskRepo::new(fx.db.clone());
        let task = repo.create(&fx.session.session_id, None).unwrap();

        // The cancel path read version 0; the run completes naturally
        // before the CAS commits.
        let stale = repo.get(&task.id).unwrap();
        let outcome = repo
            .update_status(&task.id, 0, RunStatus::Completed)
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Updated(_)));

        let handler = CancelRunHandler {
            runs: RunTaskRepo::new(fx.db.clone()),
            bus: Arc::clone(&fx.bus),
            locks: Arc::new(LockFactory::in_process()),
        };
        handler.finish_cancel(stale, &fx.session).await;
        settle().await;

        // Distinct conflict error, and the winner's status stands.
        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].content["kind"], "state_conflict");
        assert_eq!(repo.get(&task.id).unwrap().status, RunStatus::Completed);
        assert_eq!(repo.get(&task.id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn cancel_suppresses_later_run_events() {
        let fx = setup();
        let repo = RunTaskRepo::new(fx.db.clone());
        let task = repo.create(&fx.session.session_id, None).unwrap();

        fx.registry
            .dispatch(CommandType::CancelRun, json!({}), &fx.session)
            .await;

        // A slow agent loop publishes after the cancel landed
        fx.bus.publish(Event::for_run(
            EventType::MessageDelta,
            fx.session.session_id.clone(),
            task.id,
            json!({"text": "late"}),
        ));
        settle().await;

        let events = fx.events.lock();
        assert_eq!(events.len(), 1, "late delta must be suppressed");
        assert_eq!(events[0].event_type, EventType::StatusUpdate);
    }

    #[tokio::test]
    async fn status_reports_most_recent_task() {
        let fx = setup();
        let repo = RunTaskRepo::new(fx.db.clone());
        let task = repo.create(&fx.session.session_id, None).unwrap();
        repo.update_status(&task.id, 0, RunStatus::Completed).unwrap();

        fx.registry
            .dispatch(CommandType::RunStatus, json!({}), &fx.session)
            .await;
        settle().await;

        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StatusUpdate);
        assert_eq!(events[0].content["status"], "COMPLETED");
        assert_eq!(events[0].content["version"], 1);
    }

    #[tokio::test]
    async fn status_without_tasks_publishes_error() {
        let fx = setup();
        fx.registry
            .dispatch(CommandType::RunStatus, json!({}), &fx.session)
            .await;
        settle().await;

        let events = fx.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content["kind"], "no_task");
    }

    #[test]
    fn user_labels() {
        assert_eq!(user_label(RunStatus::Running), "RUNNING");
        assert_eq!(user_label(RunStatus::Aborted), "CANCELLED");
        assert_eq!(user_label(RunStatus::SystemInterrupted), "SYSTEM_INTERRUPTED");
    }
}

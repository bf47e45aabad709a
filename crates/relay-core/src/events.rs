use serde::{Deserialize, Serialize};

use crate::ids::{RunId, SessionId};

/// Kinds of events flowing through the bus.
/// Wire names are stable across every transport that carries them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run was created and the agent loop is live.
    RunStarted,
    /// Streamed agent output chunk.
    MessageDelta,
    /// Tool start/end notice from the agent loop.
    ToolActivity,
    /// Token/cost usage for a turn.
    UsageReport,
    /// Run or session status notification.
    StatusUpdate,
    /// Synthetic termination notice for a reclaimed run.
    RunInterrupted,
    /// User-visible failure from a command handler.
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::MessageDelta => "message_delta",
            Self::ToolActivity => "tool_activity",
            Self::UsageReport => "usage_report",
            Self::StatusUpdate => "status_update",
            Self::RunInterrupted => "run_interrupted",
            Self::Error => "error",
        }
    }

    /// Whether this type is delivered even when the tagged run has already
    /// left RUNNING. Termination notices must reach subscribers exactly
    /// because the run they describe is no longer live.
    pub fn always_deliver(&self) -> bool {
        matches!(self, Self::RunInterrupted)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_started" => Ok(Self::RunStarted),
            "message_delta" => Ok(Self::MessageDelta),
            "tool_activity" => Ok(Self::ToolActivity),
            "usage_report" => Ok(Self::UsageReport),
            "status_update" => Ok(Self::StatusUpdate),
            "run_interrupted" => Ok(Self::RunInterrupted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// One event as published on the bus and pushed to transports.
///
/// Immutable after construction — a hook that wants a different event
/// builds a new one. Wire format:
/// `{"type": ..., "sessionId": ..., "runId": ...|null, "content": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: SessionId,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub content: serde_json::Value,
}

impl Event {
    /// A session-scoped event (no run tag; never gate-suppressed).
    pub fn for_session(
        event_type: EventType,
        session_id: SessionId,
        content: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            session_id,
            run_id: None,
            content,
        }
    }

    /// An event tagged with the run it belongs to.
    pub fn for_run(
        event_type: EventType,
        session_id: SessionId,
        run_id: RunId,
        content: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            session_id,
            run_id: Some(run_id),
            content,
        }
    }

    /// A user-visible failure with a machine-readable kind tag.
    pub fn error(session_id: SessionId, kind: &str, message: impl Into<String>) -> Self {
        Self::for_session(
            EventType::Error,
            session_id,
            serde_json::json!({ "kind": kind, "message": message.into() }),
        )
    }

    /// Copy of this event with different content.
    pub fn with_content(&self, content: serde_json::Value) -> Self {
        Self {
            event_type: self.event_type,
            session_id: self.session_id.clone(),
            run_id: self.run_id.clone(),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_keys() {
        let evt = Event::for_run(
            EventType::MessageDelta,
            SessionId::from_raw("sess_1"),
            RunId::from_raw("run_1"),
            json!({"text": "hello"}),
        );
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v["type"], "message_delta");
        assert_eq!(v["sessionId"], "sess_1");
        assert_eq!(v["runId"], "run_1");
        assert_eq!(v["content"]["text"], "hello");
    }

    #[test]
    fn session_event_serializes_null_run_id() {
        let evt = Event::for_session(
            EventType::StatusUpdate,
            SessionId::from_raw("sess_1"),
            json!({}),
        );
        let v = serde_json::to_value(&evt).unwrap();
        assert!(v["runId"].is_null());
    }

    #[test]
    fn deserialize_without_run_id() {
        let json = r#"{"type":"status_update","sessionId":"sess_1","content":{}}"#;
        let evt: Event = serde_json::from_str(json).unwrap();
        assert!(evt.run_id.is_none());
        assert_eq!(evt.event_type, EventType::StatusUpdate);
    }

    #[test]
    fn error_event_carries_kind_and_message() {
        let evt = Event::error(SessionId::from_raw("sess_1"), "state_conflict", "lost the race");
        assert_eq!(evt.event_type, EventType::Error);
        assert!(evt.run_id.is_none());
        assert_eq!(evt.content["kind"], "state_conflict");
        assert_eq!(evt.content["message"], "lost the race");
    }

    #[test]
    fn allowlist_classification() {
        assert!(EventType::RunInterrupted.always_deliver());
        assert!(!EventType::StatusUpdate.always_deliver());
        assert!(!EventType::MessageDelta.always_deliver());
        assert!(!EventType::Error.always_deliver());
    }

    #[test]
    fn event_type_display_from_str_roundtrip() {
        let all = [
            EventType::RunStarted,
            EventType::MessageDelta,
            EventType::ToolActivity,
            EventType::UsageReport,
            EventType::StatusUpdate,
            EventType::RunInterrupted,
            EventType::Error,
        ];
        for et in &all {
            let parsed: EventType = et.as_str().parse().unwrap();
            assert_eq!(*et, parsed);
        }
        assert!("no_such_type".parse::<EventType>().is_err());
    }

    #[test]
    fn with_content_preserves_routing() {
        let evt = Event::for_run(
            EventType::MessageDelta,
            SessionId::from_raw("sess_1"),
            RunId::from_raw("run_1"),
            json!({"text": "long"}),
        );
        let trimmed = evt.with_content(json!({"text": "l"}));
        assert_eq!(trimmed.session_id, evt.session_id);
        assert_eq!(trimmed.run_id, evt.run_id);
        assert_eq!(trimmed.event_type, evt.event_type);
        assert_eq!(trimmed.content["text"], "l");
    }

    #[test]
    fn serde_roundtrip() {
        let evt = Event::for_run(
            EventType::UsageReport,
            SessionId::new(),
            RunId::new(),
            json!({"inputTokens": 1200, "outputTokens": 340}),
        );
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
    }
}

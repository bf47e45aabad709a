//! Built-in enrichment hooks.

use relay_core::events::{Event, EventType};

use crate::bus::EventHook;

const DEFAULT_MAX_TEXT_BYTES: usize = 16 * 1024;

/// Truncates oversized `content.text` fields so one noisy tool result
/// cannot bloat every transport and the event log.
pub struct ContentLimitHook {
    max_bytes: usize,
}

impl ContentLimitHook {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for ContentLimitHook {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TEXT_BYTES)
    }
}

impl EventHook for ContentLimitHook {
    fn name(&self) -> &str {
        "content_limit"
    }

    fn should_process(&self, event: &Event) -> bool {
        matches!(
            event.event_type,
            EventType::MessageDelta | EventType::ToolActivity
        )
    }

    fn process(&self, event: Event) -> anyhow::Result<Option<Event>> {
        let Some(text) = event.content.get("text").and_then(|t| t.as_str()) else {
            return Ok(Some(event));
        };
        if text.len() <= self.max_bytes {
            return Ok(Some(event));
        }

        let truncated = truncate_at_char_boundary(text, self.max_bytes);
        let mut content = event.content.clone();
        content["text"] = serde_json::json!(truncated);
        content["truncated"] = serde_json::json!(true);
        Ok(Some(event.with_content(content)))
    }
}

/// Drops MessageDelta events with no text — they carry nothing for any
/// subscriber.
pub struct EmptyDeltaFilter;

impl EventHook for EmptyDeltaFilter {
    fn name(&self) -> &str {
        "empty_delta_filter"
    }

    fn should_process(&self, event: &Event) -> bool {
        event.event_type == EventType::MessageDelta
    }

    fn process(&self, event: Event) -> anyhow::Result<Option<Event>> {
        match event.content.get("text").and_then(|t| t.as_str()) {
            Some(text) if !text.is_empty() => Ok(Some(event)),
            _ => Ok(None),
        }
    }
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ids::{RunId, SessionId};
    use serde_json::json;

    fn delta(text: &str) -> Event {
        Event::for_run(
            EventType::MessageDelta,
            SessionId::new(),
            RunId::new(),
            json!({"text": text}),
        )
    }

    #[test]
    fn content_limit_passes_small_text() {
        let hook = ContentLimitHook::new(100);
        let evt = delta("short");
        let out = hook.process(evt).unwrap().unwrap();
        assert_eq!(out.content["text"], "short");
        assert!(out.content.get("truncated").is_none());
    }

    #[test]
    fn content_limit_truncates_large_text() {
        let hook = ContentLimitHook::new(10);
        let evt = delta("0123456789abcdef");
        let out = hook.process(evt).unwrap().unwrap();
        assert_eq!(out.content["text"], "0123456789");
        assert_eq!(out.content["truncated"], true);
    }

    #[test]
    fn content_limit_respects_char_boundaries() {
        let hook = ContentLimitHook::new(5);
        // 'é' is two bytes; a naive byte slice at 5 would split it
        let evt = delta("ééééé");
        let out = hook.process(evt).unwrap().unwrap();
        let text = out.content["text"].as_str().unwrap();
        assert_eq!(text, "éé");
    }

    #[test]
    fn content_limit_skips_non_text_content() {
        let hook = ContentLimitHook::new(1);
        let evt = Event::for_run(
            EventType::ToolActivity,
            SessionId::new(),
            RunId::new(),
            json!({"tool": "bash"}),
        );
        let out = hook.process(evt).unwrap().unwrap();
        assert_eq!(out.content["tool"], "bash");
    }

    #[test]
    fn content_limit_only_targets_payload_types() {
        let hook = ContentLimitHook::default();
        let status = Event::for_session(EventType::StatusUpdate, SessionId::new(), json!({}));
        assert!(!hook.should_process(&status));
        assert!(hook.should_process(&delta("x")));
    }

    #[test]
    fn empty_delta_is_dropped() {
        let hook = EmptyDeltaFilter;
        assert!(hook.process(delta("")).unwrap().is_none());
        assert!(hook
            .process(Event::for_run(
                EventType::MessageDelta,
                SessionId::new(),
                RunId::new(),
                json!({}),
            ))
            .unwrap()
            .is_none());
    }

    #[test]
    fn non_empty_delta_passes() {
        let hook = EmptyDeltaFilter;
        let out = hook.process(delta("hello")).unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn truncate_at_char_boundary_exact() {
        assert_eq!(truncate_at_char_boundary("hello", 5), "hello");
        assert_eq!(truncate_at_char_boundary("hello", 10), "hello");
        assert_eq!(truncate_at_char_boundary("hello", 3), "hel");
    }
}

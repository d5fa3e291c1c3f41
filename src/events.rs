//! Decoding and reduction of the Codex `--json` event stream.
//!
//! The stream is newline-delimited JSON where every object carries a string
//! `type`. Lines that are blank, not JSON, or lack a string `type` are dropped.
//! Recognised types decode into [`EventKind`]; anything else (including a
//! recognised type whose payload has an unexpected shape) is preserved as
//! [`Event::Opaque`] and ignored by the reducers.

use crate::harness::line_buffer::LineBuffer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Item {
    AgentMessage {
        #[serde(default)]
        id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    CommandExecution {
        #[serde(default)]
        id: String,
        command: String,
        #[serde(default)]
        status: String,
        #[serde(default, alias = "aggregated_output", skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    FileChange {
        #[serde(default)]
        id: String,
        path: String,
        #[serde(default, alias = "kind")]
        action: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    #[serde(rename = "item.started")]
    ItemStarted { item: Item },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: Item },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Known(EventKind),
    /// An event this crate does not model, kept verbatim.
    Opaque(serde_json::Value),
}

impl Event {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Known(EventKind::ThreadStarted { .. }) => "thread.started",
            Self::Known(EventKind::TurnStarted) => "turn.started",
            Self::Known(EventKind::TurnCompleted { .. }) => "turn.completed",
            Self::Known(EventKind::ItemStarted { .. }) => "item.started",
            Self::Known(EventKind::ItemCompleted { .. }) => "item.completed",
            Self::Known(EventKind::Error { .. }) => "error",
            Self::Opaque(raw) => raw
                .get("type")
                .and_then(|value| value.as_str())
                .unwrap_or_default(),
        }
    }

    fn completed_item(&self) -> Option<&Item> {
        match self {
            Self::Known(EventKind::ItemCompleted { item }) => Some(item),
            _ => None,
        }
    }
}

pub fn parse_line(line: &str) -> Option<Event> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = serde_json::from_str::<serde_json::Value>(trimmed).ok()?;
    value.get("type")?.as_str()?;
    Some(match serde_json::from_value::<EventKind>(value.clone()) {
        Ok(kind) => Event::Known(kind),
        Err(_) => Event::Opaque(value),
    })
}

pub fn parse_stream(raw: &str) -> Vec<Event> {
    raw.lines().filter_map(parse_line).collect()
}

/// Incremental form of [`parse_stream`] fed with raw stdout chunks.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    lines: LineBuffer,
    events: Vec<Event>,
    skipped_lines: usize,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns how many events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let before = self.events.len();
        for line in self.lines.push(chunk) {
            self.accept(&line);
        }
        self.events.len() - before
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn finish(mut self) -> Vec<Event> {
        let rest = self.lines.flush();
        self.accept(&rest);
        if self.skipped_lines > 0 {
            tracing::debug!(skipped = self.skipped_lines, "dropped undecodable event lines");
        }
        self.events
    }

    fn accept(&mut self, line: &str) {
        match parse_line(line) {
            Some(event) => self.events.push(event),
            None if !line.trim().is_empty() => self.skipped_lines += 1,
            None => {}
        }
    }
}

/// Text of the last completed agent message, or an empty string.
pub fn final_message(events: &[Event]) -> String {
    events
        .iter()
        .rev()
        .filter_map(Event::completed_item)
        .find_map(|item| match item {
            Item::AgentMessage { text, .. } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Paths of completed file changes, first occurrence wins.
pub fn files_changed(events: &[Event]) -> Vec<String> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter_map(Event::completed_item)
        .filter_map(|item| match item {
            Item::FileChange { path, .. } => Some(path),
            _ => None,
        })
        .filter(|path| seen.insert(path.as_str()))
        .cloned()
        .collect()
}

/// Commands of completed executions in order, repeats included.
pub fn commands_run(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(Event::completed_item)
        .filter_map(|item| match item {
            Item::CommandExecution { command, .. } => Some(command.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSummary {
    pub final_message: String,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub thread_id: Option<String>,
    pub usage: Option<Usage>,
}

pub fn summarize(events: &[Event]) -> EventSummary {
    let thread_id = events.iter().find_map(|event| match event {
        Event::Known(EventKind::ThreadStarted { thread_id }) => Some(thread_id.clone()),
        _ => None,
    });
    let usage = events.iter().rev().find_map(|event| match event {
        Event::Known(EventKind::TurnCompleted { usage: Some(usage) }) => Some(usage.clone()),
        _ => None,
    });

    EventSummary {
        final_message: final_message(events),
        files_changed: files_changed(events),
        commands_run: commands_run(events),
        thread_id,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = r#"{"type":"thread.started","thread_id":"th_1"}
{"type":"turn.started"}
{"type":"item.completed","item":{"id":"m1","type":"agent_message","text":"first"}}
not json at all
{"no_type":true}
{"type":42}
{"type":"item.completed","item":{"id":"c1","type":"command_execution","command":"cargo test","status":"completed","exit_code":0}}
{"type":"item.completed","item":{"id":"f1","type":"file_change","path":"src/lib.rs","action":"modified"}}
{"type":"item.completed","item":{"id":"c2","type":"command_execution","command":"cargo test","status":"completed"}}
{"type":"item.completed","item":{"id":"f2","type":"file_change","path":"src/main.rs","action":"added"}}
{"type":"item.completed","item":{"id":"f3","type":"file_change","path":"src/lib.rs","action":"modified"}}
{"type":"item.completed","item":{"id":"m2","type":"agent_message","text":"second"}}
{"type":"item.started","item":{"id":"m3","type":"agent_message","text":"unfinished"}}
{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":4}}
"#;

    #[test]
    fn skips_malformed_and_typeless_lines() {
        let events = parse_stream(STREAM);
        assert_eq!(events.len(), 11);
        assert!(parse_line("   ").is_none());
        assert!(parse_line("{\"type\":null}").is_none());
        assert!(parse_line("[1,2]").is_none());
    }

    #[test]
    fn final_message_ignores_started_messages() {
        let events = parse_stream(STREAM);
        assert_eq!(final_message(&events), "second");
        assert_eq!(final_message(&[]), "");
    }

    #[test]
    fn files_changed_dedupes_in_first_seen_order() {
        let events = parse_stream(STREAM);
        assert_eq!(files_changed(&events), vec!["src/lib.rs", "src/main.rs"]);
    }

    #[test]
    fn commands_run_keeps_repeats() {
        let events = parse_stream(STREAM);
        assert_eq!(commands_run(&events), vec!["cargo test", "cargo test"]);
    }

    #[test]
    fn unknown_types_are_preserved_as_opaque() {
        let event = parse_line(r#"{"type":"item.updated","item":{"id":"x"},"extra":1}"#).expect("event");
        assert_eq!(event.event_type(), "item.updated");
        assert!(matches!(event, Event::Opaque(_)));

        let reasoning = parse_line(r#"{"type":"item.completed","item":{"id":"r","type":"reasoning","text":"hm"}}"#)
            .expect("event");
        assert!(matches!(reasoning, Event::Opaque(_)));
        assert_eq!(final_message(&[reasoning]), "");
    }

    #[test]
    fn summary_carries_thread_and_usage() {
        let summary = summarize(&parse_stream(STREAM));
        assert_eq!(summary.thread_id.as_deref(), Some("th_1"));
        assert_eq!(summary.usage.map(|usage| usage.output_tokens), Some(4));
    }

    #[test]
    fn decoder_matches_whole_stream_parse() {
        let mut decoder = EventStreamDecoder::new();
        let bytes = STREAM.trim_end().as_bytes();
        for chunk in bytes.chunks(7) {
            decoder.push(chunk);
        }
        assert_eq!(decoder.skipped_lines(), 3);
        let events = decoder.finish();
        assert_eq!(events, parse_stream(STREAM));
    }

    #[test]
    fn opaque_events_serialize_verbatim() {
        let event = parse_line(r#"{"type":"custom","payload":[1]}"#).expect("event");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["payload"][0], 1);
        let known = parse_line(r#"{"type":"turn.started"}"#).expect("event");
        assert_eq!(serde_json::to_value(&known).expect("serialize")["type"], "turn.started");
    }
}

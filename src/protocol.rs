//! Line protocol spoken by the editing worker on stdout.
//!
//! Each line is either exactly one JSON object (a [`ProgressEvent`]) or
//! free-form diagnostic text. A record must fit on one line: a JSON object
//! spread over several lines, or several objects concatenated on the same
//! line, is not supported and comes out as diagnostics.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::state_machine::{AgentKey, AgentState};

/// One structured record emitted by the worker. Every field is optional and
/// `null` counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Direct per-agent statuses. Unknown agents and unknown status values are
    /// dropped while parsing.
    #[serde(
        default,
        rename = "agentStatus",
        deserialize_with = "lenient_agent_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_status: Option<BTreeMap<AgentKey, AgentState>>,

    #[serde(default, alias = "qualityScore", skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    #[serde(default, alias = "outputPath", skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn lenient_agent_status<'de, D>(
    deserializer: D,
) -> Result<Option<BTreeMap<AgentKey, AgentState>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(serde_json::Value::Object(entries)) = raw else {
        return Ok(None);
    };

    let statuses: BTreeMap<_, _> = entries
        .iter()
        .filter_map(|(agent, state)| {
            let agent = AgentKey::from_wire(agent)?;
            let state = AgentState::from_wire(state.as_str()?)?;
            Some((agent, state))
        })
        .collect();
    // Nothing recognised: let the stage drive agent status instead.
    if statuses.is_empty() {
        return Ok(None);
    }
    Ok(Some(statuses))
}

/// Result of classifying one complete output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Event(ProgressEvent),
    /// Text for the log only. `parse_error` is set when the line looked like a
    /// record but could not be decoded.
    Diagnostic {
        text: String,
        parse_error: Option<String>,
    },
}

/// Classifies a single line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed.starts_with('{') {
        return Some(ParsedLine::Diagnostic {
            text: trimmed.to_string(),
            parse_error: None,
        });
    }

    Some(match serde_json::from_str::<ProgressEvent>(trimmed) {
        Ok(event) => ParsedLine::Event(event),
        Err(err) => ParsedLine::Diagnostic {
            text: trimmed.to_string(),
            parse_error: Some(err.to_string()),
        },
    })
}

/// Reassembles complete lines from arbitrarily split byte chunks.
///
/// A trailing partial line stays buffered until its newline arrives or the
/// stream ends.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    // Prefix of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(decode(&self.pending[start..end]));
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Flushes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        self.scanned = 0;
        Some(decode(&raw))
    }
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// [`LineDecoder`] followed by [`parse_line`].
#[derive(Debug, Default)]
pub struct ProgressParser {
    decoder: LineDecoder,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParsedLine> {
        self.decoder
            .push(chunk)
            .iter()
            .filter_map(|line| parse_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Option<ParsedLine> {
        self.decoder.finish().and_then(|line| parse_line(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> ProgressEvent {
        match parse_line(line) {
            Some(ParsedLine::Event(event)) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn parses_full_completion_record() {
        let e = event(
            r#"{"stage":"completed","message":"Processing complete! Quality: 8.5/10","agentStatus":{"analysis":"completed","qc":"completed"},"strategy":"gemini","quality_score":8.5,"output_path":"/out/a_edited.jpg","success":true}"#,
        );
        assert_eq!(e.stage.as_deref(), Some("completed"));
        assert_eq!(e.quality_score, Some(8.5));
        assert_eq!(e.output_path.as_deref(), Some("/out/a_edited.jpg"));
        assert_eq!(e.success, Some(true));
        let statuses = e.agent_status.unwrap();
        assert_eq!(statuses[&AgentKey::Analysis], AgentState::Completed);
        assert_eq!(statuses.len(), 2);
    }

    #[test]
    fn nulls_are_absent() {
        let e = event(r#"{"stage":"analysis","quality_score":null,"strategy":null,"output_path":null}"#);
        assert_eq!(e.quality_score, None);
        assert_eq!(e.strategy, None);
        assert_eq!(e.output_path, None);
    }

    #[test]
    fn unknown_agents_and_states_are_dropped() {
        let e = event(r#"{"agentStatus":{"analysis":"running","ocr":"running","qc":"exploded"}}"#);
        let statuses = e.agent_status.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[&AgentKey::Analysis], AgentState::Running);
    }

    #[test]
    fn agent_status_with_only_unknown_agents_is_absent() {
        let e = event(r#"{"stage":"analysis_complete","agentStatus":{"ocr":"completed"}}"#);
        assert!(e.agent_status.is_none());
        assert_eq!(e.stage.as_deref(), Some("analysis_complete"));
    }

    #[test]
    fn non_object_agent_status_is_ignored() {
        let e = event(r#"{"stage":"analysis","agentStatus":"busy"}"#);
        assert!(e.agent_status.is_none());
        assert_eq!(e.stage.as_deref(), Some("analysis"));
    }

    #[test]
    fn free_text_is_diagnostic() {
        assert_eq!(
            parse_line("Loading model weights..."),
            Some(ParsedLine::Diagnostic {
                text: "Loading model weights...".into(),
                parse_error: None,
            })
        );
    }

    #[test]
    fn malformed_record_is_diagnostic_with_error() {
        match parse_line(r#"{"stage": "analysis""#) {
            Some(ParsedLine::Diagnostic { parse_error, .. }) => assert!(parse_error.is_some()),
            other => panic!("expected diagnostic, got {other:?}"),
        }
    }

    #[test]
    fn concatenated_records_are_rejected() {
        let parsed = parse_line(r#"{"stage":"analysis"}{"stage":"analysis_complete"}"#);
        assert!(matches!(parsed, Some(ParsedLine::Diagnostic { parse_error: Some(_), .. })));
    }

    #[test]
    fn wrongly_typed_field_is_diagnostic() {
        let parsed = parse_line(r#"{"quality_score":"high"}"#);
        assert!(matches!(parsed, Some(ParsedLine::Diagnostic { .. })));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   \t"), None);
    }

    #[test]
    fn decoder_reassembles_split_lines() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(br#"{"stage":"ana"#).is_empty());
        let lines = decoder.push(b"lysis\"}\n{\"stage\":");
        assert_eq!(lines, vec![r#"{"stage":"analysis"}"#.to_string()]);
        let lines = decoder.push(b"\"qc\"}\r\n");
        assert_eq!(lines, vec![r#"{"stage":"qc"}"#.to_string()]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_flushes_trailing_partial_line() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"first\nsecond"), vec!["first".to_string()]);
        assert_eq!(decoder.finish(), Some("second".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_keeps_multibyte_chars_split_across_chunks() {
        let text = "qualidade ótima\n".as_bytes();
        let split = text.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(decoder.push(&text[split..]), vec!["qualidade ótima".to_string()]);
    }

    #[test]
    fn long_line_in_small_chunks_scans_linearly() {
        const LEN: usize = 16 * 1024 * 1024;
        let chunk = [b'x'; 8 * 1024];
        let mut decoder = LineDecoder::new();

        let started = std::time::Instant::now();
        for _ in 0..LEN / chunk.len() {
            assert!(decoder.push(&chunk).is_empty());
        }
        let lines = decoder.push(b"\nnext");
        let elapsed = started.elapsed();

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), LEN);
        assert_eq!(decoder.finish(), Some("next".to_string()));
        assert!(
            elapsed < std::time::Duration::from_secs(5),
            "16 MiB line took {elapsed:?}"
        );
    }

    #[test]
    fn parser_interleaves_events_and_diagnostics() {
        let mut parser = ProgressParser::new();
        let parsed = parser.feed(b"{\"stage\":\"analysis\"}\nnot json\n\n{\"stage\":");
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], ParsedLine::Event(_)));
        assert!(matches!(parsed[1], ParsedLine::Diagnostic { .. }));

        let parsed = parser.feed(b"\"qc\"}");
        assert!(parsed.is_empty());
        match parser.finish() {
            Some(ParsedLine::Event(e)) => assert_eq!(e.stage.as_deref(), Some("qc")),
            other => panic!("expected trailing event, got {other:?}"),
        }
    }
}

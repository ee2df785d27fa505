//! Server-sent-event framing for the upstream byte stream.
//!
//! The upstream wraps its tagged text in an OpenAI-like envelope: each
//! `data:` line is a JSON object whose `choices[0].delta.content` carries
//! the next slice of text. Only that slice matters downstream; usage and
//! finish_reason are captured when the upstream includes them.

use serde::Deserialize;

/// One SSE line, split into its field.
#[derive(Debug)]
pub enum SseLine {
    Event(String),
    Data(String),
}

/// Parse a single SSE line (`event: <type>` or `data: <payload>`).
pub fn parse_sse_line(line: &str) -> Option<SseLine> {
    if let Some(event_type) = line.strip_prefix("event:") {
        Some(SseLine::Event(event_type.trim_start().to_string()))
    } else {
        line.strip_prefix("data:")
            .map(|data| SseLine::Data(data.trim_start().to_string()))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpstreamUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    usage: Option<UpstreamUsage>,
}

#[derive(Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: UpstreamDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct UpstreamDelta {
    content: Option<String>,
}

/// Incremental decoder from raw upstream bytes to content deltas.
///
/// Feed arbitrary text chunks; complete lines are consumed immediately and
/// the trailing partial line is carried over to the next feed.
pub struct SseDeltas {
    line_buf: String,
    done: bool,
    finish_reason: Option<String>,
    usage: Option<UpstreamUsage>,
}

impl SseDeltas {
    pub fn new() -> Self {
        Self {
            line_buf: String::new(),
            done: false,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.line_buf.push_str(chunk);
        let buffered = std::mem::take(&mut self.line_buf);

        let mut deltas = Vec::new();
        let lines: Vec<&str> = buffered.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        for line in complete {
            self.handle_line(line, &mut deltas);
        }
        self.line_buf = remainder.first().copied().unwrap_or("").to_string();
        deltas
    }

    /// Consume whatever is left in the line buffer at end of input.
    pub fn finish(&mut self) -> Vec<String> {
        let last = std::mem::take(&mut self.line_buf);
        let mut deltas = Vec::new();
        self.handle_line(&last, &mut deltas);
        deltas
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<UpstreamUsage> {
        self.usage
    }

    fn handle_line(&mut self, line: &str, deltas: &mut Vec<String>) {
        if self.done {
            return;
        }
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Some(SseLine::Data(data)) = parse_sse_line(line) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(chunk) = serde_json::from_str::<UpstreamChunk>(&data) else {
            return;
        };
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                if !reason.is_empty() {
                    self.finish_reason = Some(reason);
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    deltas.push(content);
                }
            }
        }
    }
}

impl Default for SseDeltas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_events_decode_to_deltas() {
        let mut sse = SseDeltas::new();
        let deltas = sse.feed(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
             data: [DONE]\n\n",
        );
        assert_eq!(deltas, ["Hello", " world"]);
        assert!(sse.is_done());
    }

    #[test]
    fn split_lines_carry_over_between_feeds() {
        let mut sse = SseDeltas::new();
        let mut deltas = sse.feed("data: {\"choices\":[{\"delta\":{\"con");
        assert!(deltas.is_empty());
        deltas.extend(sse.feed("tent\":\"Hi\"}}]}\n\n"));
        assert_eq!(deltas, ["Hi"]);
    }

    #[test]
    fn usage_and_finish_reason_are_captured() {
        let mut sse = SseDeltas::new();
        sse.feed(
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"},\"finish_reason\":\"stop\"}],\
             \"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\n",
        );
        assert_eq!(sse.finish_reason(), Some("stop"));
        let usage = sse.usage().unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (7, 3));
    }

    #[test]
    fn junk_lines_are_ignored() {
        let mut sse = SseDeltas::new();
        let deltas = sse.feed(
            ": comment\nevent: ping\ndata: not json\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        );
        assert_eq!(deltas, ["ok"]);
    }

    #[test]
    fn nothing_after_done_is_decoded() {
        let mut sse = SseDeltas::new();
        let deltas = sse.feed(
            "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        );
        assert!(deltas.is_empty());
        assert!(sse.is_done());
    }
}

//! Upstream-to-OpenAI response translation.
//!
//! The upstream interleaves `<think>...</think>` and `<answer>...</answer>`
//! regions in its delta text. [`TagParser`] splits that text into channels
//! with a byte-level look-behind carry (at most one byte shorter than the
//! longest tag), so tags straddling chunk boundaries never leak and every
//! byte is examined once. The emission layer re-wraps thinking with literal
//! delimiters inside the single OpenAI `content` channel, or drops it.

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, ChunkChoice, CompletionChoice, Delta,
    FunctionCallOut, ToolCallDelta, ToolCallOut, Usage,
};
use crate::sse::SseDeltas;
use crate::toolcall::{extract_tool_calls, ExtractedCall};
use crate::upstream::body_signals_auth_failure;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const ANSWER_OPEN: &str = "<answer>";
pub const ANSWER_CLOSE: &str = "</answer>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Before any tag; emits like `InAnswer`.
    Outside,
    InThink,
    InAnswer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Answer(String),
    Think(String),
}

enum TagMatch {
    Full(&'static str, ParseState),
    Partial,
    Literal,
}

fn match_tag(s: &str) -> TagMatch {
    const TAGS: [(&str, ParseState); 4] = [
        (THINK_OPEN, ParseState::InThink),
        (THINK_CLOSE, ParseState::Outside),
        (ANSWER_OPEN, ParseState::InAnswer),
        (ANSWER_CLOSE, ParseState::Outside),
    ];
    for (tag, next) in TAGS {
        if s.starts_with(tag) {
            return TagMatch::Full(tag, next);
        }
    }
    for (tag, _) in TAGS {
        if tag.starts_with(s) {
            return TagMatch::Partial;
        }
    }
    TagMatch::Literal
}

/// Single-pass splitter of tagged upstream text into think/answer segments.
/// Tag markers themselves are consumed, never emitted.
pub struct TagParser {
    state: ParseState,
    carry: String,
}

impl TagParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Outside,
            carry: String::new(),
        }
    }

    pub fn feed(&mut self, input: &str) -> Vec<Segment> {
        let mut data = std::mem::take(&mut self.carry);
        data.push_str(input);

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut pos = 0;
        while pos < data.len() {
            let Some(rel) = data[pos..].find('<') else {
                current.push_str(&data[pos..]);
                break;
            };
            current.push_str(&data[pos..pos + rel]);
            let tag_start = pos + rel;
            match match_tag(&data[tag_start..]) {
                TagMatch::Full(tag, next) => {
                    self.flush(&mut segments, &mut current);
                    self.state = next;
                    pos = tag_start + tag.len();
                }
                TagMatch::Partial => {
                    // Might be a tag split across chunks: hold it back.
                    self.carry = data[tag_start..].to_string();
                    self.flush(&mut segments, &mut current);
                    return segments;
                }
                TagMatch::Literal => {
                    current.push('<');
                    pos = tag_start + 1;
                }
            }
        }
        self.flush(&mut segments, &mut current);
        segments
    }

    /// Release any held-back bytes at end of stream. A partial tag that
    /// never completed is plain text.
    pub fn finish(&mut self) -> Vec<Segment> {
        let rest = std::mem::take(&mut self.carry);
        let mut segments = Vec::new();
        if !rest.is_empty() {
            let mut current = rest;
            self.flush(&mut segments, &mut current);
        }
        segments
    }

    fn flush(&self, segments: &mut Vec<Segment>, current: &mut String) {
        if current.is_empty() {
            return;
        }
        let text = std::mem::take(current);
        segments.push(match self.state {
            ParseState::InThink => Segment::Think(text),
            ParseState::Outside | ParseState::InAnswer => Segment::Answer(text),
        });
    }
}

impl Default for TagParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-wraps think text with literal delimiters inside the client-visible
/// content channel, or drops it when thinking output is off.
struct ThinkFold {
    output_thinking: bool,
    open: bool,
}

impl ThinkFold {
    fn new(output_thinking: bool) -> Self {
        Self {
            output_thinking,
            open: false,
        }
    }

    fn answer(&mut self, text: &str, out: &mut String) {
        self.close(out);
        out.push_str(text);
    }

    fn think(&mut self, text: &str, out: &mut String) {
        if !self.output_thinking {
            return;
        }
        if !self.open {
            out.push_str(THINK_OPEN);
            self.open = true;
        }
        out.push_str(text);
    }

    fn close(&mut self, out: &mut String) {
        if self.open {
            out.push_str(THINK_CLOSE);
            self.open = false;
        }
    }
}

/// Word-count-like token estimator. Not exact, but monotone under append,
/// which is all the usage fields promise.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    let quarters = text.chars().count().div_ceil(4);
    words.max(quarters) as u32
}

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// Model id reported back to the client.
    pub model: String,
    pub output_thinking: bool,
    /// Run the extractor over the accumulated answer at end of stream.
    pub tools_enabled: bool,
    pub declared_tools: Vec<String>,
    /// tool_choice `auto`: keep calls naming undeclared tools.
    pub keep_undeclared: bool,
    pub scan_limit: usize,
}

/// Per-response chunk factory: one id and creation stamp shared by every
/// chunk, `delta.role` set on the first content chunk only.
pub struct ChunkEmitter {
    id: String,
    created: i64,
    model: String,
    sent_first: bool,
}

impl ChunkEmitter {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            sent_first: false,
        }
    }

    pub fn content(&mut self, text: String) -> ChatCompletionChunk {
        let role = (!self.sent_first).then_some("assistant");
        self.sent_first = true;
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role,
                    content: Some(text),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            error: None,
        }
    }

    pub fn finish(
        &self,
        finish_reason: &str,
        calls: &[ExtractedCall],
        error: Option<String>,
    ) -> ChatCompletionChunk {
        let tool_calls = (!calls.is_empty()).then(|| {
            calls
                .iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index: index as u32,
                    id: call.id.clone(),
                    kind: "function",
                    function: FunctionCallOut {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect()
        });
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: None,
                    tool_calls,
                },
                finish_reason: Some(finish_reason.to_string()),
            }],
            error: error.map(|message| {
                serde_json::json!({ "message": message, "type": "upstream_error" })
            }),
        }
    }
}

/// Drive a streaming upstream response, emitting translated chunks into
/// `tx` as they are produced. A dropped receiver (client disconnect) stops
/// the upstream read cooperatively.
pub async fn run_stream(
    resp: reqwest::Response,
    opts: TranslateOptions,
    tx: mpsc::Sender<ChatCompletionChunk>,
) {
    stream_chunks(resp.bytes_stream(), opts, tx).await;
}

async fn stream_chunks<S>(mut byte_stream: S, opts: TranslateOptions, tx: mpsc::Sender<ChatCompletionChunk>)
where
    S: futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    let mut emitter = ChunkEmitter::new(&opts.model);
    let mut sse = SseDeltas::new();
    let mut parser = TagParser::new();
    let mut fold = ThinkFold::new(opts.output_thinking);
    let mut answer_acc = String::new();
    let mut upstream_error: Option<String> = None;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                upstream_error = Some(e.to_string());
                break;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        for delta in sse.feed(text) {
            let mut out = String::new();
            for segment in parser.feed(&delta) {
                fold_segment(&mut fold, segment, &mut out, &mut answer_acc, &mut String::new());
            }
            if !out.is_empty() {
                debug!(len = out.len(), "stream content delta");
                if tx.send(emitter.content(out)).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
        if sse.is_done() {
            break;
        }
    }

    // Flush the SSE line buffer and the parser's held-back bytes, close an
    // open think wrapper.
    let mut out = String::new();
    for delta in sse.finish() {
        for segment in parser.feed(&delta) {
            fold_segment(&mut fold, segment, &mut out, &mut answer_acc, &mut String::new());
        }
    }
    for segment in parser.finish() {
        fold_segment(&mut fold, segment, &mut out, &mut answer_acc, &mut String::new());
    }
    fold.close(&mut out);
    if !out.is_empty() && tx.send(emitter.content(out)).await.is_err() {
        return;
    }

    let mut calls = Vec::new();
    if opts.tools_enabled {
        calls = extract_tool_calls(
            &answer_acc,
            &opts.declared_tools,
            opts.keep_undeclared,
            opts.scan_limit,
        )
        .calls;
    }
    let finish_reason = if calls.is_empty() { "stop" } else { "tool_calls" };
    let _ = tx
        .send(emitter.finish(finish_reason, &calls, upstream_error))
        .await;
}

fn fold_segment(
    fold: &mut ThinkFold,
    segment: Segment,
    out: &mut String,
    answer_acc: &mut String,
    think_acc: &mut String,
) {
    match segment {
        Segment::Answer(text) => {
            answer_acc.push_str(&text);
            fold.answer(&text, out);
        }
        Segment::Think(text) => {
            think_acc.push_str(&text);
            fold.think(&text, out);
        }
    }
}

/// Aggregate a full upstream response into one `chat.completion` object.
pub async fn collect(
    resp: reqwest::Response,
    opts: &TranslateOptions,
    prompt_text: &str,
) -> Result<ChatCompletion> {
    let body = resp.text().await.map_err(|e| {
        if e.is_timeout() {
            RelayError::Timeout
        } else {
            RelayError::Transport(e)
        }
    })?;
    collect_from_body(&body, opts, prompt_text)
}

pub fn collect_from_body(
    body: &str,
    opts: &TranslateOptions,
    prompt_text: &str,
) -> Result<ChatCompletion> {
    let mut sse = SseDeltas::new();
    let mut parser = TagParser::new();
    let mut fold = ThinkFold::new(opts.output_thinking);
    let mut composite = String::new();
    let mut answer_acc = String::new();
    let mut think_acc = String::new();

    let mut deltas = sse.feed(body);
    deltas.extend(sse.finish());
    let saw_sse =
        !deltas.is_empty() || sse.is_done() || sse.finish_reason().is_some() || sse.usage().is_some();

    let mut usage = sse.usage();
    if saw_sse {
        for delta in deltas {
            for segment in parser.feed(&delta) {
                fold_segment(&mut fold, segment, &mut composite, &mut answer_acc, &mut think_acc);
            }
        }
    } else {
        // Some error paths answer with a plain JSON body instead of SSE.
        let value: serde_json::Value = serde_json::from_str(body.trim())
            .map_err(|e| RelayError::Parse(format!("upstream body is neither SSE nor JSON: {e}")))?;
        if body_signals_auth_failure(&value) {
            return Err(RelayError::TokenRejected { status: 200 });
        }
        let text = value
            .pointer("/choices/0/message/content")
            .or_else(|| value.pointer("/choices/0/delta/content"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| RelayError::Parse("upstream response has no content".to_string()))?
            .to_string();
        if usage.is_none() {
            usage = value
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok());
        }
        for segment in parser.feed(&text) {
            fold_segment(&mut fold, segment, &mut composite, &mut answer_acc, &mut think_acc);
        }
    }

    for segment in parser.finish() {
        fold_segment(&mut fold, segment, &mut composite, &mut answer_acc, &mut think_acc);
    }
    fold.close(&mut composite);

    let mut tool_calls = Vec::new();
    let content = if opts.tools_enabled {
        let extraction = extract_tool_calls(
            &answer_acc,
            &opts.declared_tools,
            opts.keep_undeclared,
            opts.scan_limit,
        );
        if extraction.calls.is_empty() {
            composite
        } else {
            tool_calls = extraction.calls;
            let mut content = String::new();
            if opts.output_thinking && !think_acc.is_empty() {
                content.push_str(THINK_OPEN);
                content.push_str(&think_acc);
                content.push_str(THINK_CLOSE);
                if !extraction.text.is_empty() {
                    content.push('\n');
                }
            }
            content.push_str(&extraction.text);
            content
        }
    } else {
        composite
    };

    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };
    let (prompt_tokens, completion_tokens) = match usage {
        Some(u) if u.prompt_tokens > 0 || u.completion_tokens > 0 => {
            (u.prompt_tokens, u.completion_tokens)
        }
        _ => (estimate_tokens(prompt_text), estimate_tokens(&content)),
    };

    Ok(ChatCompletion {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion",
        created: Utc::now().timestamp(),
        model: opts.model.clone(),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
                tool_calls: (!tool_calls.is_empty()).then(|| {
                    tool_calls
                        .iter()
                        .map(|call| ToolCallOut {
                            id: call.id.clone(),
                            kind: "function",
                            function: FunctionCallOut {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect()
                }),
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(segments: &[Segment]) -> (String, String) {
        let mut answer = String::new();
        let mut think = String::new();
        for segment in segments {
            match segment {
                Segment::Answer(t) => answer.push_str(t),
                Segment::Think(t) => think.push_str(t),
            }
        }
        (answer, think)
    }

    fn opts(output_thinking: bool) -> TranslateOptions {
        TranslateOptions {
            model: "MBZUAI-IFM/K2-Think".to_string(),
            output_thinking,
            tools_enabled: false,
            declared_tools: Vec::new(),
            keep_undeclared: false,
            scan_limit: 200_000,
        }
    }

    fn opts_with_tools(names: &[&str]) -> TranslateOptions {
        TranslateOptions {
            tools_enabled: true,
            declared_tools: names.iter().map(|s| s.to_string()).collect(),
            keep_undeclared: true,
            ..opts(true)
        }
    }

    #[test]
    fn text_outside_tags_is_answer() {
        let mut parser = TagParser::new();
        let mut segments = parser.feed("plain text");
        segments.extend(parser.finish());
        assert_eq!(segments, [Segment::Answer("plain text".to_string())]);
    }

    #[test]
    fn think_and_answer_regions_split() {
        let mut parser = TagParser::new();
        let segments = parser.feed("<think>reasoning</think><answer>reply</answer>");
        let (answer, think) = concat(&segments);
        assert_eq!(answer, "reply");
        assert_eq!(think, "reasoning");
    }

    #[test]
    fn tag_split_across_chunks_never_leaks() {
        let mut parser = TagParser::new();
        let mut segments = parser.feed("<thi");
        assert!(segments.is_empty());
        segments.extend(parser.feed("nk>secret</th"));
        segments.extend(parser.feed("ink><answer>42</answer>"));
        segments.extend(parser.finish());

        let (answer, think) = concat(&segments);
        assert_eq!(answer, "42");
        assert_eq!(think, "secret");
    }

    #[test]
    fn literal_angle_bracket_passes_through() {
        let mut parser = TagParser::new();
        let mut segments = parser.feed("1 < 2 and <thinker> stays");
        segments.extend(parser.finish());
        let (answer, _) = concat(&segments);
        assert_eq!(answer, "1 < 2 and <thinker> stays");
    }

    #[test]
    fn unterminated_think_region_closes_at_eos() {
        let mut parser = TagParser::new();
        let mut segments = parser.feed("<think>half a thought");
        segments.extend(parser.finish());
        let (answer, think) = concat(&segments);
        assert_eq!(answer, "");
        assert_eq!(think, "half a thought");
    }

    #[test]
    fn partial_tag_at_eos_is_released_as_text() {
        let mut parser = TagParser::new();
        let mut segments = parser.feed("a <thi");
        segments.extend(parser.finish());
        let (answer, _) = concat(&segments);
        assert_eq!(answer, "a <thi");
    }

    #[test]
    fn repeated_regions_accumulate_in_order() {
        let mut parser = TagParser::new();
        let segments =
            parser.feed("<answer>one</answer><think>t1</think><answer>two</answer>");
        let (answer, think) = concat(&segments);
        assert_eq!(answer, "onetwo");
        assert_eq!(think, "t1");
    }

    #[test]
    fn estimator_is_monotone_under_append() {
        let mut prev = 0;
        let mut text = String::new();
        for piece in ["Hello", " world", "!", " more-tokens here", "xxxxxxxxxx"] {
            text.push_str(piece);
            let estimate = estimate_tokens(&text);
            assert!(estimate >= prev);
            prev = estimate;
        }
        assert!(estimate_tokens("four word test here") >= 4);
    }

    #[test]
    fn emitter_sets_role_on_first_chunk_only() {
        let mut emitter = ChunkEmitter::new("m");
        let first = emitter.content("a".to_string());
        let second = emitter.content("b".to_string());
        assert_eq!(first.choices[0].delta.role, Some("assistant"));
        assert!(second.choices[0].delta.role.is_none());
        assert_eq!(first.id, second.id);

        let last = emitter.finish("stop", &[], None);
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(last.choices[0].delta.content.is_none());
    }

    fn sse_body(deltas: &[&str]) -> String {
        let mut body = String::new();
        for delta in deltas {
            let event = serde_json::json!({"choices": [{"delta": {"content": delta}}]});
            body.push_str(&format!("data: {event}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn collect_plain_answer() {
        let body = sse_body(&["<answer>Hello</answer>"]);
        let completion = collect_from_body(&body, &opts(true), "Hi").unwrap();
        assert_eq!(completion.choices[0].message.content, "Hello");
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.model, "MBZUAI-IFM/K2-Think");
        assert_eq!(
            completion.usage.total_tokens,
            completion.usage.prompt_tokens + completion.usage.completion_tokens
        );
    }

    #[test]
    fn collect_preserves_thinking_when_enabled() {
        let body = sse_body(&["<think>why</think>", "<answer>done</answer>"]);
        let completion = collect_from_body(&body, &opts(true), "q").unwrap();
        assert_eq!(
            completion.choices[0].message.content,
            "<think>why</think>done"
        );
    }

    #[test]
    fn collect_drops_thinking_when_disabled() {
        let body = sse_body(&["<think>why</think>", "<answer>done</answer>"]);
        let completion = collect_from_body(&body, &opts(false), "q").unwrap();
        assert_eq!(completion.choices[0].message.content, "done");
    }

    #[test]
    fn collect_extracts_tool_calls() {
        let body = sse_body(&[
            "<answer>Sure.\n```json\n{\"tool_calls\":[{\"name\":\"get_weather\",\"arguments\":{\"city\":\"Paris\"}}]}\n```\n</answer>",
        ]);
        let completion =
            collect_from_body(&body, &opts_with_tools(&["get_weather"]), "q").unwrap();

        let message = &completion.choices[0].message;
        assert_eq!(message.content, "Sure.");
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].kind, "function");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Paris\"}");
        assert_eq!(completion.choices[0].finish_reason, "tool_calls");
    }

    #[test]
    fn collect_prefers_upstream_usage() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"<answer>x</answer>\"}}],\
                    \"usage\":{\"prompt_tokens\":11,\"completion_tokens\":5}}\n\ndata: [DONE]\n\n";
        let completion = collect_from_body(body, &opts(true), "q").unwrap();
        assert_eq!(completion.usage.prompt_tokens, 11);
        assert_eq!(completion.usage.completion_tokens, 5);
        assert_eq!(completion.usage.total_tokens, 16);
    }

    #[test]
    fn collect_falls_back_to_plain_json_body() {
        let body = r#"{"choices":[{"message":{"content":"<answer>plain</answer>"}}],"usage":{"prompt_tokens":2,"completion_tokens":1}}"#;
        let completion = collect_from_body(body, &opts(true), "q").unwrap();
        assert_eq!(completion.choices[0].message.content, "plain");
        assert_eq!(completion.usage.prompt_tokens, 2);
    }

    #[test]
    fn collect_flags_auth_failure_body() {
        let body = r#"{"detail":"Unauthorized"}"#;
        let err = collect_from_body(body, &opts(true), "q").unwrap_err();
        assert!(matches!(err, RelayError::TokenRejected { status: 200 }));
    }

    #[test]
    fn collect_rejects_garbage_body() {
        let err = collect_from_body("<html>bad gateway</html>", &opts(true), "q").unwrap_err();
        assert!(matches!(err, RelayError::Parse(_)));
    }

    #[tokio::test]
    async fn stream_translates_and_terminates() {
        let events = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"<think>reasoning</think>\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"<answer>The answer is\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" 42</answer>\"}}]}\n\ndata: [DONE]\n\n",
        ];
        let byte_stream = futures_util::stream::iter(
            events
                .iter()
                .map(|e| Ok(bytes::Bytes::from_static(e.as_bytes())))
                .collect::<Vec<reqwest::Result<bytes::Bytes>>>(),
        );

        let (tx, mut rx) = mpsc::channel(16);
        stream_chunks(byte_stream, opts(false), tx).await;

        let mut content = String::new();
        let mut finish_reason = None;
        let mut first_role = None;
        let mut count = 0;
        while let Some(chunk) = rx.recv().await {
            let choice = &chunk.choices[0];
            if count == 0 {
                first_role = choice.delta.role;
            }
            count += 1;
            if let Some(text) = &choice.delta.content {
                content.push_str(text);
            }
            if let Some(reason) = &choice.finish_reason {
                finish_reason = Some(reason.clone());
            }
        }
        assert_eq!(content, "The answer is 42");
        assert_eq!(first_role, Some("assistant"));
        assert_eq!(finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn stream_wraps_thinking_when_enabled() {
        let events = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"<thi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"nk>hm</think><answer>ok</answer>\"}}]}\n\ndata: [DONE]\n\n",
        ];
        let byte_stream = futures_util::stream::iter(
            events
                .iter()
                .map(|e| Ok(bytes::Bytes::from_static(e.as_bytes())))
                .collect::<Vec<reqwest::Result<bytes::Bytes>>>(),
        );

        let (tx, mut rx) = mpsc::channel(16);
        stream_chunks(byte_stream, opts(true), tx).await;

        let mut content = String::new();
        while let Some(chunk) = rx.recv().await {
            if let Some(text) = &chunk.choices[0].delta.content {
                content.push_str(text);
            }
        }
        assert_eq!(content, "<think>hm</think>ok");
    }

    #[tokio::test]
    async fn stream_emits_tool_calls_on_final_chunk() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"<answer>```json\\n{\\\"tool_calls\\\":[{\\\"name\\\":\\\"f\\\",\\\"arguments\\\":{}}]}\\n```</answer>\"}}]}\n\ndata: [DONE]\n\n";
        let byte_stream = futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(
            bytes::Bytes::from_static(event.as_bytes()),
        )]);

        let (tx, mut rx) = mpsc::channel(16);
        stream_chunks(byte_stream, opts_with_tools(&["f"]), tx).await;

        let mut last = None;
        while let Some(chunk) = rx.recv().await {
            last = Some(chunk);
        }
        let last = last.unwrap();
        let choice = &last.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "f");
    }
}

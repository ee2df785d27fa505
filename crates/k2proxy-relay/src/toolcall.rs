//! Tool-call extraction from free-form answer text.
//!
//! The upstream has no structured tool field; models emit call JSON inside
//! the answer. Four forms are recognized, tried in order:
//!
//! 1. a ```json fence whose object carries `tool_calls` / `function_call`
//!    or is itself a `{name, arguments}` object naming a declared tool;
//! 2. a ```json fence holding an array of `{name, arguments}` objects;
//! 3. an inline JSON object of the same shapes (balanced-brace scan);
//! 4. `call <name> with {...}`, case-insensitive.
//!
//! The fenced form is canonical; the others are best-effort fallbacks.
//! Extraction is pure: same input, same calls, same residual text.

use serde_json::Value;

/// One extracted call, normalized to the OpenAI shape: `arguments` is a
/// JSON-serialized string even when the model emitted an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub calls: Vec<ExtractedCall>,
    /// The answer text with matched fragments removed. Unchanged when no
    /// call was extracted; empty when only whitespace would remain.
    pub text: String,
}

struct RawCall {
    name: String,
    arguments: Value,
}

/// Span of a matched fragment plus the calls it yielded.
struct Match {
    start: usize,
    end: usize,
    calls: Vec<RawCall>,
}

/// Scan `text` for embedded tool calls. Only the last `scan_limit` bytes
/// are examined; `declared` filters call names, except that undeclared
/// names survive when `keep_undeclared` is set (tool_choice `auto`).
pub fn extract_tool_calls(
    text: &str,
    declared: &[String],
    keep_undeclared: bool,
    scan_limit: usize,
) -> Extraction {
    let start = if text.len() > scan_limit {
        let mut s = text.len() - scan_limit;
        while !text.is_char_boundary(s) {
            s += 1;
        }
        s
    } else {
        0
    };
    let (prefix, window) = text.split_at(start);

    let mut matches = find_fenced(window, declared);
    if matches.is_empty() {
        matches = find_inline(window, declared);
    }
    if matches.is_empty() {
        matches = find_natural_language(window);
    }

    // Drop undeclared names; a span whose every call was dropped stays in
    // the text untouched.
    let declared_set: Vec<&str> = declared.iter().map(String::as_str).collect();
    let mut kept: Vec<Match> = Vec::new();
    for mut m in matches {
        if !keep_undeclared {
            m.calls.retain(|c| declared_set.contains(&c.name.as_str()));
        }
        if !m.calls.is_empty() {
            kept.push(m);
        }
    }

    if kept.is_empty() {
        return Extraction {
            calls: Vec::new(),
            text: text.to_string(),
        };
    }

    let mut calls = Vec::new();
    for m in &kept {
        for raw in &m.calls {
            calls.push(ExtractedCall {
                id: format!("call_{}", calls.len()),
                name: raw.name.clone(),
                arguments: serialize_arguments(&raw.arguments),
            });
        }
    }

    let cleaned = remove_spans(window, &kept);
    let mut out = String::with_capacity(prefix.len() + cleaned.len());
    out.push_str(prefix);
    out.push_str(&cleaned);
    Extraction {
        calls,
        text: out.trim().to_string(),
    }
}

fn serialize_arguments(arguments: &Value) -> String {
    match arguments {
        // A string that already is JSON passes through; anything else is
        // quoted so the result is always valid JSON.
        Value::String(s) => {
            if serde_json::from_str::<Value>(s).is_ok() {
                s.clone()
            } else {
                serde_json::to_string(s).unwrap_or_else(|_| "{}".to_string())
            }
        }
        other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
    }
}

// ── forms 1 + 2: fenced code blocks ──────────────────────────────────────────

fn find_fenced(window: &str, declared: &[String]) -> Vec<Match> {
    const OPEN: &str = "```json";
    const CLOSE: &str = "```";

    let mut matches = Vec::new();
    let mut idx = 0;
    while let Some(rel) = window[idx..].find(OPEN) {
        let open = idx + rel;
        let content_start = open + OPEN.len();
        let Some(rel_close) = window[content_start..].find(CLOSE) else {
            break;
        };
        let close = content_start + rel_close;
        let end = close + CLOSE.len();
        let inner = window[content_start..close].trim();

        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            if let Some(calls) = calls_from_value(&value, declared) {
                matches.push(Match {
                    start: open,
                    end,
                    calls,
                });
            }
        }
        idx = end;
    }
    matches
}

// ── form 3: inline JSON objects ──────────────────────────────────────────────

fn find_inline(window: &str, declared: &[String]) -> Vec<Match> {
    let mut matches = Vec::new();
    let mut idx = 0;
    while let Some(rel) = window[idx..].find('{') {
        let open = idx + rel;
        let Some(len) = balanced_object_len(&window[open..]) else {
            idx = open + 1;
            continue;
        };
        let candidate = &window[open..open + len];
        if looks_like_call(candidate) {
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                if let Some(calls) = calls_from_value(&value, declared) {
                    matches.push(Match {
                        start: open,
                        end: open + len,
                        calls,
                    });
                    idx = open + len;
                    continue;
                }
            }
        }
        idx = open + 1;
    }
    matches
}

/// Cheap pre-filter before parsing an inline candidate.
fn looks_like_call(candidate: &str) -> bool {
    candidate.contains("\"tool_calls\"")
        || candidate.contains("\"function_call\"")
        || (candidate.contains("\"name\"") && candidate.contains("\"arguments\""))
}

/// Length of the balanced JSON object starting at byte 0 (which must be
/// `{`), accounting for strings and escapes. `None` if unbalanced.
fn balanced_object_len(s: &str) -> Option<usize> {
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ── form 4: natural-language pattern ─────────────────────────────────────────

/// `call <name> with {...}`, case-insensitive, name limited to identifier
/// characters. Declared-name filtering happens with the shared filter.
fn find_natural_language(window: &str) -> Vec<Match> {
    let bytes = window.as_bytes();
    let mut matches = Vec::new();
    let mut idx = 0;
    while idx + 4 <= bytes.len() {
        if !window[idx..idx + 4].eq_ignore_ascii_case("call") {
            idx += 1;
            continue;
        }
        let word_start = idx == 0 || !bytes[idx - 1].is_ascii_alphanumeric();
        if !word_start {
            idx += 1;
            continue;
        }
        if let Some(m) = parse_nl_call(window, idx) {
            idx = m.end;
            matches.push(m);
        } else {
            idx += 4;
        }
    }
    matches
}

fn parse_nl_call(window: &str, start: usize) -> Option<Match> {
    let mut pos = start + 4;

    // At least one space between "call" and the name.
    let after_ws = skip_ws(window, pos);
    if after_ws == pos {
        return None;
    }
    pos = after_ws;

    let name_start = pos;
    while pos < window.len() && is_ident_byte(window.as_bytes()[pos]) {
        pos += 1;
    }
    if pos == name_start {
        return None;
    }
    let name = window[name_start..pos].to_string();

    let after_ws = skip_ws(window, pos);
    if after_ws == pos {
        return None;
    }
    pos = after_ws;
    if window.len() < pos + 4 || !window[pos..pos + 4].eq_ignore_ascii_case("with") {
        return None;
    }
    pos = skip_ws(window, pos + 4);

    if window.as_bytes().get(pos) != Some(&b'{') {
        return None;
    }
    let len = balanced_object_len(&window[pos..])?;
    let arguments = serde_json::from_str::<Value>(&window[pos..pos + len]).ok()?;
    Some(Match {
        start,
        end: pos + len,
        calls: vec![RawCall { name, arguments }],
    })
}

fn skip_ws(window: &str, mut pos: usize) -> usize {
    let bytes = window.as_bytes();
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.'
}

// ── shared shape recognition ─────────────────────────────────────────────────

fn calls_from_value(value: &Value, declared: &[String]) -> Option<Vec<RawCall>> {
    match value {
        Value::Object(map) => {
            if let Some(arr) = map.get("tool_calls").and_then(Value::as_array) {
                let calls: Vec<RawCall> = arr.iter().filter_map(call_from_entry).collect();
                return (!calls.is_empty()).then_some(calls);
            }
            if let Some(fc) = map.get("function_call") {
                return call_from_entry(fc).map(|c| vec![c]);
            }
            // Bare {name, arguments}: accepted only for a declared tool so
            // arbitrary JSON with a "name" key is not hijacked.
            if let Some(name) = map.get("name").and_then(Value::as_str) {
                if declared.iter().any(|d| d == name) {
                    return call_from_entry(value).map(|c| vec![c]);
                }
            }
            None
        }
        Value::Array(arr) => {
            let calls: Vec<RawCall> = arr.iter().filter_map(call_from_entry).collect();
            (!arr.is_empty() && calls.len() == arr.len()).then_some(calls)
        }
        _ => None,
    }
}

/// `{name, arguments}` with unknown fields dropped. Also accepts the
/// nested `{function: {name, arguments}}` entry OpenAI models emit.
fn call_from_entry(value: &Value) -> Option<RawCall> {
    let map = value.as_object()?;
    let map = match map.get("function").and_then(Value::as_object) {
        Some(inner) => inner,
        None => map,
    };
    let name = map.get("name")?.as_str()?.to_string();
    let arguments = map
        .get("arguments")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));
    Some(RawCall { name, arguments })
}

// ── span removal ─────────────────────────────────────────────────────────────

fn remove_spans(window: &str, matches: &[Match]) -> String {
    let mut spans: Vec<(usize, usize)> = matches
        .iter()
        .map(|m| widen_over_whitespace(window, m.start, m.end))
        .collect();
    spans.sort();

    let mut out = String::with_capacity(window.len());
    let mut pos = 0;
    for (start, end) in spans {
        if end <= pos {
            continue;
        }
        let start = start.max(pos);
        let piece = &window[pos..start];
        if !out.is_empty()
            && !piece.is_empty()
            && !out.ends_with(char::is_whitespace)
            && !piece.starts_with(char::is_whitespace)
        {
            out.push(' ');
        }
        out.push_str(piece);
        pos = end;
    }
    let tail = &window[pos..];
    if !out.is_empty()
        && !tail.is_empty()
        && !out.ends_with(char::is_whitespace)
        && !tail.starts_with(char::is_whitespace)
    {
        out.push(' ');
    }
    out.push_str(tail);
    out
}

/// Swallow the whitespace hugging a removed fragment so the join reads
/// cleanly; a single space is reinserted when both neighbors are words.
fn widen_over_whitespace(window: &str, mut start: usize, mut end: usize) -> (usize, usize) {
    while start > 0 {
        let prev = window[..start].chars().next_back().unwrap();
        if prev.is_whitespace() {
            start -= prev.len_utf8();
        } else {
            break;
        }
    }
    while end < window.len() {
        let next = window[end..].chars().next().unwrap();
        if next.is_whitespace() {
            end += next.len_utf8();
        } else {
            break;
        }
    }
    (start, end)
}

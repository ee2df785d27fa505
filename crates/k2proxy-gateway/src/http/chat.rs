//! POST /v1/chat/completions — the request dispatcher.
//!
//! Authenticates the client, rewrites the OpenAI request into the upstream
//! schema (flattened content, synthesized tool prompt, model override),
//! then loops over pool selections: token-level failures are accounted and
//! retried with the next token, everything else maps straight to an HTTP
//! error. Successful upstream responses are handed to the translator,
//! streaming or aggregated.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use k2proxy_pool::TokenLease;
use k2proxy_relay::openai::{
    flatten_content, ChatCompletionChunk, ChatCompletionRequest, ToolDecl, ToolPolicy,
};
use k2proxy_relay::translate::{self, TranslateOptions};
use k2proxy_relay::RelayError;

use crate::app::AppState;
use crate::auth::check_client_auth;
use crate::error::ApiError;

const VALID_ROLES: [&str; 4] = ["system", "user", "assistant", "tool"];

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Response, ApiError> {
    check_client_auth(&headers, &state.config)?;

    let req: ChatCompletionRequest = serde_json::from_value(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
    let (policy, declared) = validate_request(&req)?;

    let tools_enabled =
        state.config.tool_support && !declared.is_empty() && policy != ToolPolicy::None;

    // Model override: the client's string is logged, never forwarded.
    let model = if state.config.model_override {
        if req.model != state.config.upstream_model_id {
            debug!(client_model = %req.model, "model override applied");
        }
        state.config.upstream_model_id.clone()
    } else {
        req.model.clone()
    };

    let (body, prompt_text) = build_upstream_body(&req, &model, tools_enabled, &policy);
    let opts = TranslateOptions {
        model,
        output_thinking: state.config.output_thinking,
        tools_enabled,
        declared_tools: declared,
        keep_undeclared: policy == ToolPolicy::Auto,
        scan_limit: state.config.scan_limit,
    };

    info!(stream = req.stream, tools = tools_enabled, "chat completion request");
    dispatch(&state, req.stream, &body, &opts, &prompt_text).await
}

fn validate_request(
    req: &ChatCompletionRequest,
) -> Result<(ToolPolicy, Vec<String>), ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }
    for message in &req.messages {
        if !VALID_ROLES.contains(&message.role.as_str()) {
            return Err(ApiError::BadRequest(format!(
                "invalid message role: {}",
                message.role
            )));
        }
    }
    for tool in &req.tools {
        if tool.kind != "function" {
            return Err(ApiError::BadRequest(format!(
                "unsupported tool type: {}",
                tool.kind
            )));
        }
    }

    let policy = ToolPolicy::from_choice(&req.tool_choice).map_err(ApiError::BadRequest)?;
    let declared: Vec<String> = req.tools.iter().map(|t| t.function.name.clone()).collect();
    match &policy {
        ToolPolicy::Required if declared.is_empty() => {
            return Err(ApiError::BadRequest(
                "tool_choice \"required\" needs at least one tool".to_string(),
            ));
        }
        ToolPolicy::Named(name) if !declared.contains(name) => {
            return Err(ApiError::BadRequest(format!(
                "tool_choice names undeclared tool: {name}"
            )));
        }
        _ => {}
    }
    Ok((policy, declared))
}

/// The upstream body plus the flattened prompt text used for usage
/// estimation. The synthesized tool prompt is the only tool-aware content
/// the upstream ever sees.
fn build_upstream_body(
    req: &ChatCompletionRequest,
    model: &str,
    tools_enabled: bool,
    policy: &ToolPolicy,
) -> (Value, String) {
    let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
    let mut prompt_text = String::new();

    if tools_enabled {
        let prompt = build_tool_prompt(&req.tools, policy);
        prompt_text.push_str(&prompt);
        prompt_text.push('\n');
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    for message in &req.messages {
        let content = flatten_content(&message.content);
        prompt_text.push_str(&content);
        prompt_text.push('\n');
        messages.push(json!({ "role": message.role, "content": content }));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
    });
    for (key, value) in &req.extra {
        body[key] = value.clone();
    }
    (body, prompt_text)
}

/// Deterministic tool description block: name, description and JSON schema
/// per tool, plus emission instructions for the fenced-JSON call format.
fn build_tool_prompt(tools: &[ToolDecl], policy: &ToolPolicy) -> String {
    let mut prompt = String::from("You have access to the following tools:\n");
    for tool in tools {
        prompt.push_str(&format!("\n### {}\n", tool.function.name));
        if !tool.function.description.is_empty() {
            prompt.push_str(&format!("{}\n", tool.function.description));
        }
        prompt.push_str("Parameters (JSON Schema):\n");
        prompt.push_str(
            &serde_json::to_string_pretty(&tool.function.parameters)
                .unwrap_or_else(|_| "{}".to_string()),
        );
        prompt.push('\n');
    }
    prompt.push_str(
        "\nTo call a tool, emit exactly one JSON code block of the form:\n\
         ```json\n\
         {\"tool_calls\": [{\"name\": \"<tool name>\", \"arguments\": {<parameters>}}]}\n\
         ```\n",
    );
    match policy {
        ToolPolicy::Required => {
            prompt.push_str("You MUST call one of the tools above before answering.\n");
        }
        ToolPolicy::Named(name) => {
            prompt.push_str(&format!("You MUST call the tool \"{name}\".\n"));
        }
        ToolPolicy::Auto | ToolPolicy::None => {
            prompt.push_str("Call a tool only when it is needed to answer.\n");
        }
    }
    prompt
}

async fn dispatch(
    state: &Arc<AppState>,
    stream: bool,
    body: &Value,
    opts: &TranslateOptions,
    prompt_text: &str,
) -> Result<Response, ApiError> {
    let pool_size_at_start = state.pool.len();
    let attempts = pool_size_at_start.max(1);
    let mut last_disabled: Option<usize> = None;
    let mut refresh_triggered = false;
    let mut last_failure: Option<String> = None;

    for _ in 0..attempts {
        let Some(lease) = state.pool.select() else {
            return Err(ApiError::NoTokens);
        };

        match state.upstream.chat(lease.value(), body).await {
            Ok(resp) => {
                if stream {
                    state.pool.record_success(&lease);
                    return Ok(stream_response(resp, opts.clone()).into_response());
                }
                match translate::collect(resp, opts, prompt_text).await {
                    Ok(completion) => {
                        state.pool.record_success(&lease);
                        return Ok(Json(completion).into_response());
                    }
                    // A 200 whose body carries the well-known auth tag
                    // counts as a token failure like a 401 would.
                    Err(RelayError::TokenRejected { status }) => {
                        warn!(status, index = lease.index(), "auth failure in upstream body");
                        note_token_failure(
                            state,
                            &lease,
                            pool_size_at_start,
                            &mut last_disabled,
                            &mut refresh_triggered,
                        );
                        last_failure = Some("upstream rejected token".to_string());
                    }
                    Err(RelayError::Timeout) => return Err(ApiError::UpstreamTimeout),
                    Err(e) => {
                        // The token authenticated fine; the response itself
                        // was unusable. Not worth burning another token.
                        state.pool.record_success(&lease);
                        return Err(ApiError::Upstream(e.to_string()));
                    }
                }
            }
            Err(e @ (RelayError::TokenRejected { .. } | RelayError::Transport(_))) => {
                warn!(index = lease.index(), error = %e, "token attempt failed");
                note_token_failure(
                    state,
                    &lease,
                    pool_size_at_start,
                    &mut last_disabled,
                    &mut refresh_triggered,
                );
                last_failure = Some(e.to_string());
            }
            Err(RelayError::Timeout) => return Err(ApiError::UpstreamTimeout),
            Err(e) => return Err(ApiError::Upstream(e.to_string())),
        }
    }

    if state.pool.active_count() == 0 {
        Err(ApiError::NoTokens)
    } else {
        Err(ApiError::Upstream(
            last_failure.unwrap_or_else(|| "all token attempts failed".to_string()),
        ))
    }
}

/// Failure accounting plus the auto-refresh trigger: once two consecutive
/// distinct tokens have been disabled within one request, and the pool had
/// more than two entries to begin with, schedule a refresh (non-blocking)
/// and keep going.
fn note_token_failure(
    state: &Arc<AppState>,
    lease: &TokenLease,
    pool_size_at_start: usize,
    last_disabled: &mut Option<usize>,
    refresh_triggered: &mut bool,
) {
    let Some(outcome) = state.pool.record_failure(lease) else {
        return;
    };
    if !outcome.disabled_now {
        return;
    }
    if let Some(previous) = *last_disabled {
        if previous != lease.index() && pool_size_at_start > 2 && !*refresh_triggered {
            info!("two consecutive tokens disabled, scheduling token refresh");
            state.refresher.force_update();
            *refresh_triggered = true;
        }
    }
    *last_disabled = Some(lease.index());
}

/// Bridge the translator's chunk stream onto the client as SSE. Dropping
/// the connection drops `rx`, which cancels the translator task and the
/// upstream read cooperatively.
fn stream_response(
    resp: reqwest::Response,
    opts: TranslateOptions,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<ChatCompletionChunk>(64);
    tokio::spawn(translate::run_stream(resp, opts, tx));

    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            let json = serde_json::to_string(&chunk).unwrap_or_default();
            yield Ok(Event::default().data(json));
        }
        yield Ok(Event::default().data("[DONE]"));
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

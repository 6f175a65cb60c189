//! WS ingress proxy (C8): the per-client-connection turn loop.
//!
//! Structure follows the split-socket / spawned-write-loop /
//! handshake-then-message-loop / guaranteed-cleanup shape used throughout
//! this codebase for WS connection handling, generalized to a scheduling +
//! upstream-proxying turn instead of a local RPC dispatch.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use relay_config::OpenAiWsConfig;
use relay_contracts::Contracts;
use relay_protocol::{Account, GatewayError, PartialTurnResult, ScheduleRequest, Transport, UsageRecord};
use serde_json::Value;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    concurrency::LocalConcurrencyBroker,
    dialer::{DialError, UpstreamConnection, WsDialer},
    disconnect::{is_disconnect_close_code, is_disconnect_message},
    metrics_facade::SchedulerMetricsHandle,
    normalize::{self, TurnContext},
    resolver,
    scheduler::{Scheduler, SelectOutcome},
    stats::RuntimeStats,
    sticky::StickyStore,
};

/// WS close code this core sends to a client for each [`GatewayError`]
/// variant that terminates the connection, per the wire contract. Every
/// other variant is surfaced as a JSON error frame with the loop left
/// running, since the client may still send further turns on the same
/// connection.
fn close_code_for(err: &GatewayError) -> Option<u16> {
    match err {
        GatewayError::PolicyViolation { .. } => Some(1008), // Policy Violation
        GatewayError::InternalPanic { .. } => Some(1011),   // Internal Error
        _ => None,
    }
}

/// Sends a real WS close frame carrying `err`'s wire code and message, not
/// just the JSON text-frame error shape — required so a client reading the
/// close code (rather than parsing the last text frame) still sees why the
/// connection ended.
fn send_close_frame(out_tx: &mpsc::UnboundedSender<Message>, err: &GatewayError) {
    let Some(code) = close_code_for(err) else { return };
    let _ = out_tx.send(Message::Close(Some(CloseFrame {
        code,
        reason: err.to_string().into(),
    })));
}

/// Best-effort extraction of a human-readable message from a caught panic
/// payload, which is only ever a `&str` or `String` in practice.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fields optional hint fields the retry strategy drops on attempt 2+,
/// keeping everything else (billing/semantic fields named in the spec's
/// retry-payload strategy, e.g. `prompt_cache_key`, `instructions`, `tools`,
/// `tool_choice`, `parallel_tool_calls`, `text`) intact.
const RETRY_DROPPED_HINT_FIELDS: &[&str] = &["include", "metadata", "store"];

/// Process-wide state shared by every client connection.
pub struct GatewayCore {
    pub config: OpenAiWsConfig,
    pub contracts: Arc<Contracts>,
    pub sticky: Arc<StickyStore>,
    pub stats: Arc<RuntimeStats>,
    pub scheduler: Arc<Scheduler>,
    pub dialer: Arc<WsDialer>,
    pub broker: Arc<LocalConcurrencyBroker>,
    pub metrics: SchedulerMetricsHandle,
    pub upstreams: UpstreamRegistry,
    /// Client used for the HTTP-SSE upstream path (C4 `Transport::HttpSse`) —
    /// a plain streaming POST, no persistent connection to pool.
    pub http: reqwest::Client,
}

/// Live upstream connections kept open across turns of the same
/// conversation, keyed by an opaque id bound into C1's `response -> conn`
/// map. A connection handed out by [`Self::take`] is owned by the caller —
/// it must be returned via [`Self::put`] or dropped, never shared.
#[derive(Default)]
pub struct UpstreamRegistry {
    conns: DashMap<String, (Instant, UpstreamConnection)>,
}

impl UpstreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, conn_id: &str) -> Option<UpstreamConnection> {
        self.conns.remove(conn_id).map(|(_, (_, conn))| conn)
    }

    fn put(&self, conn_id: String, conn: UpstreamConnection) {
        self.conns.insert(conn_id, (Instant::now(), conn));
    }

    /// Drops connections idle past `idle_ttl`. Intended for a background tick.
    pub fn sweep_idle(&self, idle_ttl: Duration) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .conns
            .iter()
            .filter(|e| now.saturating_duration_since(e.value().0) > idle_ttl)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.conns.remove(&key);
        }
    }
}

/// Per-connection bookkeeping that outlives any single turn.
struct ConnectionState {
    group_id: Option<String>,
    last_account_id: Option<String>,
}

/// Accept one inbound client WS connection and drive its turn loop until it
/// disconnects. Mirrors the handshake-then-loop-then-cleanup shape used
/// elsewhere in this codebase for connection handling.
pub async fn handle_connection(socket: WebSocket, core: Arc<GatewayCore>, account_hint: Option<Account>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "ws ingress: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws ingress: write loop closed");
                break;
            }
        }
    });

    let mut state = ConnectionState {
        group_id: None,
        last_account_id: account_hint.map(|a| a.id),
    };

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                let code = frame.as_ref().map_or(1000, |f| f.code);
                if is_disconnect_close_code(code.into()) {
                    debug!(conn_id = %conn_id, code, "ws ingress: client closed normally");
                } else {
                    warn!(conn_id = %conn_id, code, "ws ingress: client closed with a non-normal code");
                }
                break;
            },
            Ok(_) => continue,
            Err(err) => {
                if is_disconnect_message(&err.to_string()) {
                    debug!(conn_id = %conn_id, "ws ingress: client disconnected");
                } else {
                    warn!(conn_id = %conn_id, error = %err, "ws ingress: read error");
                }
                break;
            },
        };

        let payload: Value = match serde_json::from_str(&frame) {
            Ok(v) => v,
            Err(err) => {
                let shape = relay_protocol::ErrorShape::from(&GatewayError::PayloadParse {
                    reason: err.to_string(),
                });
                let _ = out_tx.send(Message::Text(serde_json::to_string(&shape).unwrap_or_default().into()));
                continue;
            },
        };

        // Panic safety: `CatchPanicLayer` only wraps the synchronous upgrade
        // handler, not this task, which keeps running long after the 101
        // response completed. A panic mid-turn must still produce an
        // InternalError close instead of silently killing the task.
        let turn_result = AssertUnwindSafe(run_turn(&core, &mut state, payload)).catch_unwind().await;
        let turn_result = match turn_result {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(&panic);
                warn!(conn_id = %conn_id, reason, "ws ingress: turn panicked");
                Err(GatewayError::InternalPanic { reason })
            },
        };

        match turn_result {
            Ok(usage) => {
                if let Some(usage) = usage {
                    let _ = out_tx.send(Message::Text(
                        serde_json::to_string(&serde_json::json!({ "usage": usage })).unwrap_or_default().into(),
                    ));
                }
            },
            Err(err) => {
                warn!(conn_id = %conn_id, error = %err, "ws ingress: turn failed");
                let shape = relay_protocol::ErrorShape::from(&err);
                let _ = out_tx.send(Message::Text(serde_json::to_string(&shape).unwrap_or_default().into()));
                if close_code_for(&err).is_some() {
                    send_close_frame(&out_tx, &err);
                    break;
                }
            },
        }
    }

    // Idempotent release: whatever slot the last turn held is already
    // released by `run_turn`'s own cleanup, so nothing further is owed
    // here beyond tearing down the write task.
    drop(out_tx);
    write_handle.abort();
    info!(conn_id = %conn_id, "ws ingress: connection closed");
}

/// Runs the full per-turn pipeline: normalize, schedule, reuse-or-dial,
/// write, stream, and release. Returns usage for the caller to surface, or
/// a [`GatewayError`] on a terminal failure.
async fn run_turn(
    core: &GatewayCore,
    state: &mut ConnectionState,
    payload: Value,
) -> relay_protocol::Result<Option<UsageRecord>> {
    // 1. Policy gate, ahead of C6 normalization: a connection already bound
    // to an account (via the dedicated-mode account hint, or a prior turn on
    // this same connection) is rejected outright when that account's ws
    // policy is off, rather than silently falling back to HTTP-SSE.
    if let Some(account_id) = state.last_account_id.clone() {
        let bound_account =
            core.contracts.accounts.get(&account_id).await.map_err(|err| GatewayError::UpstreamRead {
                account_id: account_id.clone(),
                reason: err.to_string(),
            })?;
        if let Some(bound_account) = &bound_account {
            if let Some(reason) = resolver::policy_gate(bound_account, &core.config) {
                return Err(GatewayError::PolicyViolation { reason });
            }
        }
    }

    let session_hash = payload
        .get("session_hash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let requested_model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // 3. Turn normalization (C6).
    let turn_ctx = core
        .sticky
        .get_session_turn_state(state.group_id.as_deref(), &session_hash)
        .map(|s| TurnContext {
            expected_previous_response_id: s.expected_previous_response_id,
            pending_expected_call_ids: s.pending_expected_call_ids,
            store_disabled: s.store_disabled,
            last_turn_replay_input: s.last_turn_replay_input,
        })
        .unwrap_or_default();
    let normalized = normalize::normalize(payload, &turn_ctx);
    if normalized.cleared_session_last_response_id {
        core.sticky.delete_session_turn_state(state.group_id.as_deref(), &session_hash);
    }

    // 4. Schedule (C5).
    let req = ScheduleRequest {
        group_id: state.group_id.clone(),
        session_hash: session_hash.clone(),
        previous_response_id: normalized.previous_response_id.clone(),
        requested_model,
        excluded_ids: Vec::new(),
    };
    let outcome = core.scheduler.select(&req, &core.config).await?;
    let account = match outcome {
        SelectOutcome::Acquired { account, .. } => account,
        SelectOutcome::Wait { plan, .. } => {
            match core.broker.await_slot(&plan).await {
                relay_contracts::SlotAcquisition::Acquired => {
                    let acct = core
                        .contracts
                        .accounts
                        .get(&plan.account_id)
                        .await
                        .map_err(|err| GatewayError::UpstreamRead {
                            account_id: plan.account_id.clone(),
                            reason: err.to_string(),
                        })?
                        .ok_or_else(|| GatewayError::NoAvailableAccount {
                            model: req.requested_model.clone(),
                        })?;
                    acct
                },
                relay_contracts::SlotAcquisition::Unavailable => {
                    return Err(GatewayError::ConcurrencySlotUnavailable {
                        account_id: plan.account_id,
                    });
                },
            }
        },
    };

    if state.last_account_id.as_deref() != Some(account.id.as_str()) {
        if state.last_account_id.is_some() {
            core.metrics.record_account_switch();
        }
        state.last_account_id = Some(account.id.clone());
    }

    let release_guard = SlotReleaseGuard {
        contracts: core.contracts.clone(),
        account_id: account.id.clone(),
    };

    let mut first_token_ms = None;
    let result = run_turn_on_account(core, state, &account, &normalized, &session_hash, &mut first_token_ms).await;
    drop(release_guard);

    let success = result.is_ok();
    core.stats.report(&account.id, success, first_token_ms);
    result
}

async fn run_turn_on_account(
    core: &GatewayCore,
    state: &ConnectionState,
    account: &Account,
    normalized: &normalize::NormalizedTurn,
    session_hash: &str,
    first_token_ms: &mut Option<u64>,
) -> relay_protocol::Result<Option<UsageRecord>> {
    let mut attempt_payload = normalized.payload.clone();
    let mut partial = PartialTurnResult::default();
    let read_timeout = read_idle_timeout(core.config.read_timeout_seconds);

    for attempt in 1..=2 {
        if attempt > 1 {
            trim_optional_hint_fields(&mut attempt_payload);
        }

        // 5. Upstream connection reuse: a live upstream conn bound to this
        // `previousResponseID` is reused as-is; otherwise resolve a transport
        // (C4) and dial fresh.
        let reused = (attempt == 1 && !normalized.previous_response_id.is_empty())
            .then(|| core.sticky.get_response_conn(&normalized.previous_response_id))
            .flatten()
            .and_then(|conn_id| core.upstreams.take(&conn_id));

        let started = Instant::now();
        let (end, conn) = if let Some(mut conn) = reused {
            let end = write_and_stream_ws(&mut conn, &attempt_payload, read_timeout, &mut partial, &account.id, started, first_token_ms)
                .await;
            (end, Some(conn))
        } else {
            let decision = resolver::resolve_transport(Some(account), &core.config);
            debug!(account_id = %account.id, transport = ?decision.transport, reason = %decision.reason, "ws ingress: resolved transport");

            if decision.transport == Transport::HttpSse {
                let end =
                    stream_http_sse(core, account, &attempt_payload, read_timeout, &mut partial, started, first_token_ms).await;
                (end, None)
            } else {
                match dial_for_account(core, account).await {
                    Ok(mut conn) => {
                        let end = write_and_stream_ws(
                            &mut conn,
                            &attempt_payload,
                            read_timeout,
                            &mut partial,
                            &account.id,
                            started,
                            first_token_ms,
                        )
                        .await;
                        (end, Some(conn))
                    },
                    Err(err) => {
                        return Err(GatewayError::UpstreamDial {
                            account_id: account.id.clone(),
                            reason: err.to_string(),
                        });
                    },
                }
            }
        };

        match finish_stream(core, state, session_hash, &account.id, end, conn, attempt, &normalized.previous_response_id).await {
            TurnOutcome::Return(result) => return result,
            TurnOutcome::RetryWithoutPreviousResponse => {
                strip_previous_response_id(&mut attempt_payload);
                continue;
            },
        }
    }

    Err(GatewayError::UpstreamRead {
        account_id: account.id.clone(),
        reason: "exhausted retry attempts".into(),
    })
}

/// Sends `attempt_payload` over an already-dialed or reused WS conn, then
/// streams the response back.
async fn write_and_stream_ws(
    conn: &mut UpstreamConnection,
    attempt_payload: &Value,
    read_timeout: Duration,
    partial: &mut PartialTurnResult,
    account_id: &str,
    started: Instant,
    first_token_ms: &mut Option<u64>,
) -> relay_protocol::Result<StreamEnd> {
    let text = serde_json::to_string(attempt_payload).map_err(|err| GatewayError::PayloadParse {
        reason: err.to_string(),
    })?;
    conn.send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
        .await
        .map_err(|err| GatewayError::UpstreamDial {
            account_id: account_id.to_string(),
            reason: err.to_string(),
        })?;

    // 7. Stream upstream -> client, with a read-idle timeout.
    stream_upstream(conn, read_timeout, partial, account_id, started, first_token_ms).await
}

/// Outcome of post-processing one [`StreamEnd`]: either the turn is done
/// (success or failure) or the single "strip `previous_response_id` and
/// retry" recovery path applies.
enum TurnOutcome {
    Return(relay_protocol::Result<Option<UsageRecord>>),
    RetryWithoutPreviousResponse,
}

/// Shared tail of both the WS and HTTP-SSE upstream paths: binds the
/// sticky `response -> account`/`conn` keys on success, closes/drops the
/// connection as appropriate, and decides whether the "previous response not
/// found" recovery retry applies.
async fn finish_stream(
    core: &GatewayCore,
    state: &ConnectionState,
    session_hash: &str,
    account_id: &str,
    end: relay_protocol::Result<StreamEnd>,
    mut conn: Option<UpstreamConnection>,
    attempt: u32,
    previous_response_id: &str,
) -> TurnOutcome {
    match end {
        Ok(StreamEnd::Completed { response_id, usage }) => {
            if let Some(response_id) = response_id {
                let _ = core
                    .sticky
                    .bind_response_account(
                        state.group_id.as_deref(),
                        &response_id,
                        account_id,
                        Duration::from_secs(relay_protocol::STICKY_RESPONSE_TTL_SECS),
                    )
                    .await;
                if let Some(conn) = conn.take() {
                    let upstream_conn_id = uuid::Uuid::new_v4().to_string();
                    core.sticky.bind_response_conn(
                        &response_id,
                        &upstream_conn_id,
                        Duration::from_secs(relay_protocol::STICKY_RESPONSE_TTL_SECS),
                    );
                    core.upstreams.put(upstream_conn_id, conn);
                }
            } else if let Some(mut conn) = conn.take() {
                WsDialer::close(&mut conn).await;
            }
            TurnOutcome::Return(Ok(usage))
        },
        Ok(StreamEnd::Disconnected) => {
            if let Some(mut conn) = conn.take() {
                WsDialer::close(&mut conn).await;
            }
            TurnOutcome::Return(Err(GatewayError::ClientDisconnect {
                reason: "client disconnected mid-stream".into(),
            }))
        },
        Ok(StreamEnd::PreviousResponseNotFound) => {
            if let Some(mut conn) = conn.take() {
                WsDialer::close(&mut conn).await;
            }
            if attempt == 1 && core.config.ingress_previous_response_recovery_enabled {
                core.sticky.delete_session_turn_state(state.group_id.as_deref(), session_hash);
                TurnOutcome::RetryWithoutPreviousResponse
            } else {
                TurnOutcome::Return(Err(GatewayError::PreviousResponseNotFound {
                    response_id: previous_response_id.to_string(),
                }))
            }
        },
        Err(err) => {
            if let Some(mut conn) = conn.take() {
                WsDialer::close(&mut conn).await;
            }
            TurnOutcome::Return(Err(err))
        },
    }
}

async fn dial_for_account(core: &GatewayCore, account: &Account) -> Result<UpstreamConnection, DialError> {
    let headers = auth_headers(account);
    core.dialer.dial("wss://api.openai.com/v1/realtime", &headers, None).await
}

fn auth_headers(account: &Account) -> Vec<(String, String)> {
    match &account.credential {
        relay_protocol::Credential::ApiKey { key } => {
            use secrecy::ExposeSecret;
            vec![("Authorization".to_string(), format!("Bearer {}", key.expose_secret()))]
        },
        relay_protocol::Credential::OAuth { access_token, .. } => {
            use secrecy::ExposeSecret;
            vec![("Authorization".to_string(), format!("Bearer {}", access_token.expose_secret()))]
        },
    }
}

/// HTTP-SSE path (C4 `Transport::HttpSse`): the equivalent of
/// [`stream_upstream`] with no persistent upstream connection — one
/// streaming POST per turn, parsed line by line for `data:` events. Only a
/// `response.completed` event line (identified, without fully parsing every
/// line, by its minimum length and the `response.completed` sentinel) and
/// the terminal `[DONE]` marker are acted on; every other line is streamed
/// past.
async fn stream_http_sse(
    core: &GatewayCore,
    account: &Account,
    attempt_payload: &Value,
    read_timeout: Duration,
    partial: &mut PartialTurnResult,
    started: Instant,
    first_token_ms: &mut Option<u64>,
) -> relay_protocol::Result<StreamEnd> {
    let mut request = core.http.post("https://api.openai.com/v1/responses").json(attempt_payload);
    for (name, value) in auth_headers(account) {
        request = request.header(name, value);
    }

    let response = tokio::time::timeout(read_timeout, request.send())
        .await
        .map_err(|_| GatewayError::UpstreamRead {
            account_id: account.id.clone(),
            reason: "read-idle timeout".into(),
        })?
        .map_err(|err| GatewayError::UpstreamDial {
            account_id: account.id.clone(),
            reason: err.to_string(),
        })?;

    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    let mut response_id = None;

    loop {
        let chunk = match tokio::time::timeout(read_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => {
                if is_disconnect_message(&err.to_string()) {
                    return Ok(StreamEnd::Disconnected);
                }
                return Err(GatewayError::UpstreamRead {
                    account_id: account.id.clone(),
                    reason: err.to_string(),
                });
            },
            Ok(None) => return Ok(StreamEnd::Disconnected),
            Err(_) => {
                return Err(GatewayError::UpstreamRead {
                    account_id: account.id.clone(),
                    reason: "read-idle timeout".into(),
                });
            },
        };

        if first_token_ms.is_none() {
            *first_token_ms = Some(started.elapsed().as_millis() as u64);
        }

        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);

            let Some(data) = line.strip_prefix("data:").map(str::trim) else { continue };
            if data == "[DONE]" {
                return Ok(StreamEnd::Completed { response_id, usage: None });
            }
            if data.len() < relay_protocol::MIN_SSE_COMPLETION_LINE_LEN || !data.contains("response.completed") {
                continue;
            }

            let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
            if let Some(id) = event.pointer("/response/id").and_then(Value::as_str) {
                response_id = Some(id.to_string());
            }
            let usage = event.pointer("/response/usage").map(|u| UsageRecord {
                request_type: Some(relay_protocol::RequestType::Stream),
                input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                cache_read_input_tokens: u
                    .pointer("/input_tokens_details/cached_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                request_id: response_id.clone().unwrap_or_default(),
                pending_function_call_ids: partial.pending_function_call_ids.clone(),
            });
            partial.usage = usage.clone();
            return Ok(StreamEnd::Completed { response_id, usage });
        }
    }
}

enum StreamEnd {
    Completed {
        response_id: Option<String>,
        usage: Option<UsageRecord>,
    },
    Disconnected,
    PreviousResponseNotFound,
}

async fn stream_upstream(
    conn: &mut UpstreamConnection,
    read_timeout: Duration,
    partial: &mut PartialTurnResult,
    account_id: &str,
    started: Instant,
    first_token_ms: &mut Option<u64>,
) -> relay_protocol::Result<StreamEnd> {
    let mut response_id = None;
    loop {
        let next = tokio::time::timeout(read_timeout, conn.next()).await;
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                if is_disconnect_message(&err.to_string()) {
                    return Ok(StreamEnd::Disconnected);
                }
                return Err(GatewayError::UpstreamRead {
                    account_id: account_id.to_string(),
                    reason: err.to_string(),
                });
            },
            Ok(None) => return Ok(StreamEnd::Disconnected),
            Err(_) => {
                return Err(GatewayError::UpstreamRead {
                    account_id: account_id.to_string(),
                    reason: "read-idle timeout".into(),
                });
            },
        };

        let text = match frame {
            tokio_tungstenite::tungstenite::Message::Text(text) => text,
            tokio_tungstenite::tungstenite::Message::Close(_) => return Ok(StreamEnd::Disconnected),
            _ => continue,
        };

        if first_token_ms.is_none() {
            *first_token_ms = Some(started.elapsed().as_millis() as u64);
        }

        let Ok(event) = serde_json::from_str::<Value>(&text) else { continue };
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

        if event_type == "error" {
            let message = event
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if message.to_lowercase().contains("previous response") {
                return Ok(StreamEnd::PreviousResponseNotFound);
            }
        }

        if let Some(id) = event.pointer("/response/id").and_then(Value::as_str) {
            response_id = Some(id.to_string());
        }

        if event_type == "response.completed" {
            let usage = event.pointer("/response/usage").map(|u| UsageRecord {
                request_type: Some(relay_protocol::RequestType::WsV2),
                input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                cache_read_input_tokens: u
                    .pointer("/input_tokens_details/cached_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                request_id: response_id.clone().unwrap_or_default(),
                pending_function_call_ids: partial.pending_function_call_ids.clone(),
            });
            partial.usage = usage.clone();
            return Ok(StreamEnd::Completed { response_id, usage });
        }
    }
}

fn trim_optional_hint_fields(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        for field in RETRY_DROPPED_HINT_FIELDS {
            obj.remove(*field);
        }
    }
}

fn strip_previous_response_id(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("previous_response_id");
    }
}

/// Clamp a configured read-idle timeout at the 120s lower bound; `0` (or
/// anything not explicitly set) means "use the default" unclamped.
fn read_idle_timeout(configured_seconds: u64) -> Duration {
    if configured_seconds == 0 {
        Duration::from_secs(relay_protocol::DEFAULT_READ_IDLE_TIMEOUT_SECS)
    } else {
        Duration::from_secs(configured_seconds.max(relay_protocol::MIN_READ_IDLE_TIMEOUT_SECS))
    }
}

/// Releases the concurrency slot for `account_id` on drop, covering every
/// exit path out of [`run_turn`] — success, error, or panic unwind.
struct SlotReleaseGuard {
    contracts: Arc<Contracts>,
    account_id: String,
}

impl Drop for SlotReleaseGuard {
    fn drop(&mut self) {
        let contracts = self.contracts.clone();
        let account_id = self.account_id.clone();
        tokio::spawn(async move {
            let _ = contracts.concurrency.release_account_slot(&account_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_configured_timeout_uses_the_default() {
        assert_eq!(
            read_idle_timeout(0),
            Duration::from_secs(relay_protocol::DEFAULT_READ_IDLE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn sub_minimum_configured_timeout_is_clamped_up() {
        assert_eq!(read_idle_timeout(30), Duration::from_secs(relay_protocol::MIN_READ_IDLE_TIMEOUT_SECS));
    }

    #[test]
    fn above_minimum_configured_timeout_is_honored_as_is() {
        assert_eq!(read_idle_timeout(600), Duration::from_secs(600));
    }

    #[test]
    fn retry_trims_hint_fields_but_preserves_semantic_ones() {
        let mut payload = serde_json::json!({
            "include": ["foo"],
            "prompt_cache_key": "cache-1",
            "instructions": "be terse",
            "tools": [],
            "tool_choice": "auto",
            "parallel_tool_calls": true,
            "text": {"format": "json"},
        });
        trim_optional_hint_fields(&mut payload);
        assert!(payload.get("include").is_none());
        assert_eq!(payload["prompt_cache_key"], "cache-1");
        assert_eq!(payload["instructions"], "be terse");
        assert!(payload.get("tools").is_some());
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["parallel_tool_calls"], true);
        assert!(payload.get("text").is_some());
    }
}

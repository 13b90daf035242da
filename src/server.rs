use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{ALLOW, CONTENT_LENGTH};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::{Config, RelayConfig, UpstreamConfig, get_config};
use crate::content::ContentTable;
use crate::error::Error;
use crate::format::chat::IncomingRequest;
use crate::relay::{RelayContext, ResolvedDate, find_shortcut, pump};
use crate::stats::{Outcome, get_stats};
use crate::upstream::{UpstreamClient, build_request, encode_request, system_turn};

/// Maximum request body size (10 MB).
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

/// Shared server state passed to all request handlers.
pub struct ServerState {
    pub upstream: UpstreamClient,
    pub upstream_config: UpstreamConfig,
    pub relay: RelayConfig,
    pub content: ContentTable,
    /// Bound on intake plus upstream response headers
    pub request_timeout: Duration,
}

impl ServerState {
    pub fn new(config: &Config, content: ContentTable) -> Self {
        Self {
            upstream: UpstreamClient::new(&config.upstream),
            upstream_config: config.upstream.clone(),
            relay: config.relay.clone(),
            content,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        }
    }
}

/// Handle an incoming TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        let remote = remote_addr;
        async move { handle_request(req, state, remote).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = generate_request_id();

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "Received request"
    );

    let start = std::time::Instant::now();

    let response = match (&method, path.as_str()) {
        (_, "/api/chat") | (_, "/v1/chat") | (_, "/") => {
            handle_chat(req, &state, &request_id).await
        }

        (&Method::GET, "/health") => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),

        (&Method::GET, "/stats") => handle_stats(),

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"type":"error","error":{"type":"not_found","message":"Not found"}}"#,
        )),
    };

    let duration = start.elapsed();

    match response {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status >= 400 {
                warn!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request failed"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request completed"
                );
            }
            Ok(resp)
        }
        Err(e) => {
            let resp = error_to_response(&e, &request_id);
            warn!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %e,
                "Request error"
            );
            Ok(resp)
        }
    }
}

fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// Chat endpoint. Everything before the first response byte is bounded by the
/// request timeout; a relayed stream runs until the upstream or client ends it.
async fn handle_chat(
    req: Request<Incoming>,
    state: &ServerState,
    request_id: &str,
) -> Result<Response<BoxBody>, Error> {
    let stats = get_stats();
    stats.record_request();

    let result = match tokio::time::timeout(
        state.request_timeout,
        open_chat_stream(req, state, request_id),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(request_id = %request_id, "Request timed out before streaming began");
            Err(Error::Timeout(state.request_timeout))
        }
    };

    match &result {
        Ok(_) => {}
        Err(Error::Upstream { .. }) => stats.record_outcome(Outcome::UpstreamError),
        Err(_) => stats.record_outcome(Outcome::Rejected),
    }

    result
}

async fn open_chat_stream(
    req: Request<Incoming>,
    state: &ServerState,
    request_id: &str,
) -> Result<Response<BoxBody>, Error> {
    if req.method() != Method::POST {
        return Err(Error::MethodNotAllowed {
            method: req.method().to_string(),
        });
    }

    let api_key = read_credential(&state.upstream_config.api_key_env)?;

    let body = read_body_limited(req, MAX_REQUEST_SIZE).await?;
    let incoming = IncomingRequest::from_body(&body, &state.upstream_config.default_model);

    if let Some(reason) = &incoming.degradation {
        debug!(request_id = %request_id, reason = ?reason, "Request body degraded to empty history");
    }
    if incoming.dropped_turns > 0 {
        debug!(
            request_id = %request_id,
            dropped = incoming.dropped_turns,
            "Dropped conversation turns with unknown shape"
        );
    }

    // One date per request, shared by the shortcut and every relayed line
    let date = ResolvedDate::now(&state.relay);

    if let Some(shortcut) = find_shortcut(
        &state.content,
        &incoming,
        &state.relay.placeholder,
        &date,
    ) {
        info!(request_id = %request_id, intent = %shortcut.intent, "Answered from content table");

        let stats = get_stats();
        stats.record_outcome(Outcome::Shortcut);
        stats.record_intent(&shortcut.intent, shortcut.substitutions);

        let body: Vec<u8> = shortcut
            .events
            .iter()
            .flat_map(|event| event.to_frame())
            .collect();
        return Ok(sse_response(Full::new(Bytes::from(body)).boxed(), request_id));
    }

    let system = system_turn(&state.content.system_prompt);
    let upstream_request = build_request(&system, &incoming);
    log_if_enabled(request_id, "Upstream request", &upstream_request);

    debug!(
        request_id = %request_id,
        model = %incoming.model,
        turns = incoming.messages.len(),
        "Relaying to upstream"
    );

    let upstream_body = encode_request(&upstream_request)?;
    let upstream_response = state
        .upstream
        .send_streaming_request(upstream_body, &api_key)
        .await?;

    get_stats().record_outcome(Outcome::Relayed);

    let (tx, rx) = mpsc::channel::<Bytes>(state.relay.channel_capacity);
    let context = RelayContext {
        placeholder: state.relay.placeholder.clone(),
        date,
        forward_unrecognized: state.relay.forward_unrecognized,
    };

    let relay_id = request_id.to_string();
    let upstream_stream = upstream_response.into_body();
    tokio::spawn(async move {
        let summary = pump(upstream_stream, tx, context).await;
        get_stats().record_relay(&summary);
        info!(
            request_id = %relay_id,
            outcome = summary.outcome.as_str(),
            deltas = summary.counts.deltas,
            substitutions = summary.counts.substitutions,
            skipped = summary.counts.skipped,
            oversized = summary.counts.oversized,
            "Relay finished"
        );
    });

    let frames = ReceiverStream::new(rx).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    Ok(sse_response(StreamBody::new(frames).boxed(), request_id))
}

/// Read the upstream credential from the environment at request time.
fn read_credential(env_var: &str) -> Result<String, Error> {
    std::env::var(env_var)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| Error::MissingCredential {
            env_var: env_var.to_string(),
        })
}

async fn read_body_limited(req: Request<Incoming>, max_size: usize) -> Result<Bytes, Error> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(size) = declared
        && size > max_size
    {
        return Err(Error::RequestTooLarge {
            size,
            max: max_size,
        });
    }

    let collected = req
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let bytes = collected.to_bytes();
    if bytes.len() > max_size {
        return Err(Error::RequestTooLarge {
            size: bytes.len(),
            max: max_size,
        });
    }

    Ok(bytes)
}

fn handle_stats() -> Result<Response<BoxBody>, Error> {
    let json = serde_json::to_string(&get_stats().summary().to_json())?;
    Ok(json_response(StatusCode::OK, &json))
}

/// Log a serializable value as pretty-printed JSON if request logging is enabled.
fn log_if_enabled<T: serde::Serialize>(request_id: &str, label: &str, value: &T) {
    if get_config().logging.log_requests
        && let Ok(json) = serde_json::to_string_pretty(value)
    {
        info!(request_id = %request_id, "{}:\n{}", label, json);
    }
}

fn full_body(body: impl Into<Bytes>) -> BoxBody {
    Full::new(body.into()).boxed()
}

fn json_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Event-stream response with the headers that keep proxies from buffering.
fn sse_response(body: BoxBody, request_id: &str) -> Response<BoxBody> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache, no-transform")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no");

    if let Ok(value) = hyper::header::HeaderValue::from_str(request_id) {
        builder = builder.header("X-Request-Id", value);
    }

    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

/// Upstream failures pass the upstream's own text through unchanged.
fn upstream_error_response(status: u16, body: &str, request_id: &str) -> Response<BoxBody> {
    let content_type = if serde_json::from_str::<serde_json::Value>(body).is_ok() {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    debug!(request_id = %request_id, upstream_status = status, "Passing upstream error through");

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", content_type)
        .header("X-Request-Id", request_id)
        .body(full_body(body.to_string()))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn error_to_response(error: &Error, request_id: &str) -> Response<BoxBody> {
    let (status, error_type, message) = match error {
        Error::MethodNotAllowed { .. } => (
            StatusCode::METHOD_NOT_ALLOWED,
            "invalid_request_error",
            "Method not allowed".to_string(),
        ),
        // The variable name stays in the server log only
        Error::MissingCredential { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            "Service temporarily unavailable".to_string(),
        ),
        Error::RequestTooLarge { size, max } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_request_error",
            format!(
                "Request body too large: {} bytes (max: {} bytes)",
                size, max
            ),
        ),
        Error::Timeout(d) => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout_error",
            format!("Request timed out after {:?}", d),
        ),
        Error::Json(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            e.to_string(),
        ),
        Error::Http(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg.clone()),
        Error::Upstream { status, body } => {
            return upstream_error_response(*status, body, request_id);
        }
    };

    let message_with_suggestion = if let Some(suggestion) = error.suggestion() {
        format!("{}. {}", message, suggestion)
    } else {
        message
    };

    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message_with_suggestion
        },
        "request_id": request_id
    })
    .to_string();

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Request-Id", request_id);

    if matches!(error, Error::MethodNotAllowed { .. }) {
        builder = builder.header(ALLOW, "POST");
    }

    builder
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, oneshot};

use crate::config::Config;
use crate::db::Snapshotter;
use crate::httpclient::{self, HttpClient};
use crate::outgoing::{OutgoingProxy, strip_hop_by_hop_headers};
use crate::redact::redact_snapshot;
use crate::snapshot::{HttpRequest, HttpResponse, Snapshot, generate_id};
use crate::store::Store;
use crate::{body, diff};

const AUTH_SCHEME_BEARER: &str = "Bearer ";
const WWW_AUTHENTICATE_VALUE: &str = "Bearer realm=\"snapshot-tester\"";

/// Running recording proxy: a reverse proxy in front of the service that
/// brackets every forwarded call with database snapshots and an
/// outgoing-call drain, then persists the result.
pub struct RecorderHandle {
    pub listen_addr: SocketAddr,
    pub outgoing_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    state: Arc<RecorderState>,
}

impl RecorderHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
        self.state.outgoing.stop().await;
        self.state.snapshotter.close().await;
    }
}

struct RecorderState {
    config: Config,
    snapshotter: Snapshotter,
    store: Store,
    outgoing: OutgoingProxy,
    client: HttpClient,
    tags: Vec<String>,
    ignore_headers: HashSet<String>,
    rate_limiter: Option<RateGate>,
    concurrency: Option<Semaphore>,
}

pub async fn serve(config: &Config, tags: Vec<String>) -> anyhow::Result<RecorderHandle> {
    let snapshotter = Snapshotter::connect(&config.database, &config.database.connection_string)
        .await
        .context("connect to database")?;

    let store = Store::new(
        config.recording.snapshot_dir.clone(),
        config.recording.format,
    );

    let outgoing = OutgoingProxy::new(&config.recording.ignore_headers)?;
    let outgoing_addr = outgoing
        .start(config.recording.outgoing_proxy_port)
        .await
        .context("start outgoing capture proxy")?;
    tracing::info!(
        addr = %outgoing_addr,
        hint = %format!("set HTTP_PROXY=http://{outgoing_addr} on the service"),
        "outgoing capture proxy started"
    );

    let bind_addr = SocketAddr::from(([127, 0, 0, 1], config.recording.proxy_port));
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind recording proxy {bind_addr}"))?;
    let listen_addr = listener.local_addr().context("get recorder local_addr")?;

    let rate = config.recording.rate_limit;
    let rate_limiter = (rate.requests_per_second > 0.0)
        .then(|| RateGate::new(rate.requests_per_second));
    let concurrency = (rate.max_concurrent > 0).then(|| Semaphore::new(rate.max_concurrent));
    if rate_limiter.is_some() || concurrency.is_some() {
        tracing::info!(
            rps = rate.requests_per_second,
            max_concurrent = rate.max_concurrent,
            "rate limiting enabled"
        );
    }
    if !config.recording.proxy_auth_token.is_empty() {
        tracing::info!("proxy authentication enabled");
    }

    let ignore_headers = config
        .recording
        .ignore_headers
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();

    let state = Arc::new(RecorderState {
        config: config.clone(),
        snapshotter,
        store,
        outgoing,
        client: httpclient::build_http_client()?,
        tags,
        ignore_headers,
        rate_limiter,
        concurrency,
    });

    tracing::info!(
        addr = %listen_addr,
        target = %config.service.base_url,
        dir = %config.recording.snapshot_dir,
        "recording proxy started"
    );

    let accept_state = Arc::clone(&state);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&accept_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            record_handler(req, Arc::clone(&state))
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("recorder connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(RecorderHandle {
        listen_addr,
        outgoing_addr,
        shutdown_tx,
        join,
        state,
    })
}

/// Running passthrough proxy: forwards to the service without touching the
/// database or the snapshot store.
pub struct PassthroughHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl PassthroughHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn serve_passthrough(config: &Config) -> anyhow::Result<PassthroughHandle> {
    let bind_addr = SocketAddr::from(([127, 0, 0, 1], config.recording.proxy_port));
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind passthrough proxy {bind_addr}"))?;
    let listen_addr = listener.local_addr().context("get proxy local_addr")?;

    let base_url = config.service.base_url.clone();
    let client = httpclient::build_http_client()?;
    tracing::info!(addr = %listen_addr, target = %base_url, "passthrough proxy started");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let base_url = base_url.clone();
                    let client = client.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            passthrough_handler(req, base_url.clone(), client.clone())
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("passthrough connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(PassthroughHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn passthrough_handler(
    req: Request<Incoming>,
    base_url: String,
    client: HttpClient,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, incoming) = req.into_parts();
    let request_body = match incoming.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::error!("failed to read request body: {err}");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read request body",
            ));
        }
    };

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let upstream_url = format!("{}{request_uri}", base_url.trim_end_matches('/'));
    let upstream_uri: Uri = match upstream_url.parse() {
        Ok(uri) => uri,
        Err(err) => {
            tracing::error!(url = %upstream_url, "invalid upstream URL: {err}");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "invalid upstream URL"));
        }
    };

    let mut forward_headers = parts.headers.clone();
    strip_hop_by_hop_headers(&mut forward_headers);
    if let Some(authority) = upstream_uri.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            forward_headers.insert(header::HOST, value);
        }
    }

    let upstream_req = match Request::builder()
        .method(parts.method.clone())
        .uri(upstream_uri)
        .body(Full::new(request_body))
    {
        Ok(mut req) => {
            *req.headers_mut() = forward_headers;
            req
        }
        Err(err) => {
            tracing::error!("failed to build upstream request: {err}");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to build upstream request",
            ));
        }
    };

    match client.request(upstream_req).await {
        Ok(res) => {
            let status = res.status();
            let mut headers = res.headers().clone();
            strip_hop_by_hop_headers(&mut headers);
            let body = match res.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    tracing::error!("failed to read upstream response: {err}");
                    return Ok(text_response(
                        StatusCode::BAD_GATEWAY,
                        "failed to read upstream response",
                    ));
                }
            };
            let mut response = Response::new(Full::new(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        Err(err) => {
            tracing::error!("upstream request failed: {err}");
            Ok(text_response(StatusCode::BAD_GATEWAY, "upstream request failed"))
        }
    }
}

async fn record_handler(
    mut req: Request<Incoming>,
    state: Arc<RecorderState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    // Authentication runs before everything else.
    let token = state.config.recording.proxy_auth_token.as_str();
    if !token.is_empty() {
        if let Err(denied) = check_auth(req.headers_mut(), token) {
            return Ok(denied);
        }
    }

    // Steady overflow queues at the gate rather than being rejected.
    if let Some(gate) = &state.rate_limiter {
        gate.wait_turn().await;
    }

    // Concurrency cap is non-blocking: full means immediate 503.
    let _permit = match &state.concurrency {
        Some(semaphore) => match semaphore.try_acquire() {
            Ok(permit) => Some(permit),
            Err(_) => {
                return Ok(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Too many concurrent requests",
                ));
            }
        },
        None => None,
    };

    Ok(capture_and_forward(req, &state).await)
}

async fn capture_and_forward(
    req: Request<Incoming>,
    state: &RecorderState,
) -> Response<Full<Bytes>> {
    let (parts, incoming) = req.into_parts();
    let request_body = match incoming.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::error!("failed to read request body: {err}");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read request body",
            );
        }
    };

    // Pre-snapshot failure is fatal to this call: nothing is persisted.
    let db_before = match state.snapshotter.snapshot_all().await {
        Ok(db_state) => db_state,
        Err(err) => {
            tracing::error!("failed to snapshot DB before request: {err}");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to snapshot database",
            );
        }
    };

    // Discard outgoing calls left over from earlier activity.
    state.outgoing.drain();

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let (status, response_headers, response_body) = forward_to_service(
        state,
        parts.method.as_str(),
        &request_uri,
        &parts.headers,
        request_body.clone(),
    )
    .await;

    let outgoing_requests = state.outgoing.drain();

    // The client still gets the response when the post-snapshot fails; only
    // persistence is abandoned.
    match state.snapshotter.snapshot_all().await {
        Ok(db_after) => {
            let mut snap = build_snapshot(
                state,
                &parts.method.to_string(),
                &request_uri,
                &parts.headers,
                &request_body,
                db_before,
                db_after,
                outgoing_requests,
                status,
                &response_headers,
                &response_body,
            );
            if !state.config.recording.redact_fields.is_empty() {
                redact_snapshot(&mut snap, &state.config.recording.redact_fields);
            }

            match state.store.save(&snap) {
                Ok(path) => tracing::info!(
                    method = %parts.method,
                    path = %request_uri,
                    status = status.as_u16(),
                    file = %path.display(),
                    outgoing_count = snap.outgoing_requests.len(),
                    "snapshot recorded"
                ),
                Err(err) => tracing::error!("failed to save snapshot: {err}"),
            }
        }
        Err(err) => {
            tracing::error!("failed to snapshot DB after request: {err}");
        }
    }

    let mut response = Response::new(Full::new(response_body));
    *response.status_mut() = status;
    let mut headers = response_headers;
    strip_hop_by_hop_headers(&mut headers);
    *response.headers_mut() = headers;
    response
}

/// Forwards the buffered request to the service. A forwarding failure
/// degrades to a 502 with an empty body, which is also what gets recorded.
async fn forward_to_service(
    state: &RecorderState,
    method: &str,
    request_uri: &str,
    request_headers: &HeaderMap,
    request_body: Bytes,
) -> (StatusCode, HeaderMap, Bytes) {
    let base = state.config.service.base_url.trim_end_matches('/');
    let upstream_url = format!("{base}{request_uri}");
    let upstream_uri: Uri = match upstream_url.parse() {
        Ok(uri) => uri,
        Err(err) => {
            tracing::error!(url = %upstream_url, "invalid upstream URL: {err}");
            return (StatusCode::BAD_GATEWAY, HeaderMap::new(), Bytes::new());
        }
    };

    let mut forward_headers = request_headers.clone();
    strip_hop_by_hop_headers(&mut forward_headers);
    if let Some(authority) = upstream_uri.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            forward_headers.insert(header::HOST, value);
        }
    }

    let upstream_req = match Request::builder()
        .method(method)
        .uri(upstream_uri)
        .body(Full::new(request_body))
    {
        Ok(mut req) => {
            *req.headers_mut() = forward_headers;
            req
        }
        Err(err) => {
            tracing::error!(url = %upstream_url, "failed to build upstream request: {err}");
            return (StatusCode::BAD_GATEWAY, HeaderMap::new(), Bytes::new());
        }
    };

    let upstream_res = match state.client.request(upstream_req).await {
        Ok(res) => res,
        Err(err) => {
            tracing::error!(url = %upstream_url, "upstream request failed: {err}");
            return (StatusCode::BAD_GATEWAY, HeaderMap::new(), Bytes::new());
        }
    };

    let status = upstream_res.status();
    let headers = upstream_res.headers().clone();
    match upstream_res.into_body().collect().await {
        Ok(collected) => (status, headers, collected.to_bytes()),
        Err(err) => {
            tracing::error!(url = %upstream_url, "failed to read upstream response: {err}");
            (StatusCode::BAD_GATEWAY, HeaderMap::new(), Bytes::new())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_snapshot(
    state: &RecorderState,
    method: &str,
    request_uri: &str,
    request_headers: &HeaderMap,
    request_body: &Bytes,
    db_before: crate::snapshot::DbState,
    db_after: crate::snapshot::DbState,
    outgoing_requests: Vec<crate::snapshot::OutgoingRequest>,
    status: StatusCode,
    response_headers: &HeaderMap,
    response_body: &Bytes,
) -> Snapshot {
    let request_content_type = content_type_of(request_headers);
    let response_content_type = content_type_of(response_headers);

    let db_diff = diff::compute_diff(&db_before, &db_after);

    Snapshot {
        id: generate_id(),
        timestamp: Utc::now(),
        service: state.config.service.name.clone(),
        tags: state.tags.clone(),
        db_state_before: db_before,
        request: HttpRequest {
            method: method.to_owned(),
            url: request_uri.to_owned(),
            headers: httpclient::joined_headers_filtered(request_headers, &state.ignore_headers),
            body: body::parse_body(request_body, &request_content_type),
        },
        outgoing_requests,
        response: HttpResponse {
            status: status.as_u16(),
            headers: httpclient::joined_headers_filtered(response_headers, &state.ignore_headers),
            body: body::parse_body(response_body, &response_content_type),
        },
        db_state_after: db_after,
        db_diff,
    }
}

fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Bearer-token gate. On success the Authorization header is stripped so the
/// harness token never reaches the service.
fn check_auth(headers: &mut HeaderMap, token: &str) -> Result<(), Response<Full<Bytes>>> {
    let Some(auth) = headers.get(header::AUTHORIZATION) else {
        let mut response = text_response(StatusCode::UNAUTHORIZED, "Authorization required");
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(WWW_AUTHENTICATE_VALUE),
        );
        return Err(response);
    };

    let Ok(auth) = auth.to_str() else {
        return Err(text_response(
            StatusCode::UNAUTHORIZED,
            "Invalid authorization scheme, expected Bearer",
        ));
    };

    if auth.len() < AUTH_SCHEME_BEARER.len()
        || !auth[..AUTH_SCHEME_BEARER.len()].eq_ignore_ascii_case(AUTH_SCHEME_BEARER)
    {
        return Err(text_response(
            StatusCode::UNAUTHORIZED,
            "Invalid authorization scheme, expected Bearer",
        ));
    }

    if &auth[AUTH_SCHEME_BEARER.len()..] != token {
        return Err(text_response(StatusCode::FORBIDDEN, "Invalid token"));
    }

    headers.remove(header::AUTHORIZATION);
    Ok(())
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

/// Paces requests at the configured rate with a one-second burst allowance.
/// Each caller claims the next slot on a virtual schedule and is told how
/// long to sleep for it; overflow queues, it is never turned away.
struct RateGate {
    interval: Duration,
    burst_window: Duration,
    schedule: AsyncMutex<Instant>,
}

impl RateGate {
    fn new(requests_per_second: f64) -> Self {
        let interval = Duration::try_from_secs_f64(1.0 / requests_per_second)
            .unwrap_or(Duration::from_secs(60));
        let burst = requests_per_second.max(1.0).floor() as u32;
        Self {
            interval,
            burst_window: interval * (burst - 1),
            schedule: AsyncMutex::new(Instant::now()),
        }
    }

    async fn wait_turn(&self) {
        let delay = {
            let mut schedule = self.schedule.lock().await;
            reserve_slot(&mut schedule, Instant::now(), self.interval, self.burst_window)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Claims the next slot on the schedule. Slots inside the burst window are
/// immediate; later ones report the shortfall as a delay. An idle gate
/// resets to `now`, so unused capacity does not accumulate past the burst.
fn reserve_slot(
    schedule: &mut Instant,
    now: Instant,
    interval: Duration,
    burst_window: Duration,
) -> Duration {
    let slot = (*schedule).max(now);
    *schedule = slot + interval;
    slot.saturating_duration_since(now + burst_window)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use hyper::header::{self, HeaderValue};
    use hyper::{HeaderMap, StatusCode};

    use super::{check_auth, reserve_slot};

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn missing_authorization_yields_401_with_challenge() {
        let mut headers = HeaderMap::new();
        let denied = check_auth(&mut headers, "secret").unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            denied.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            &HeaderValue::from_static("Bearer realm=\"snapshot-tester\"")
        );
    }

    #[test]
    fn wrong_scheme_yields_401() {
        let mut headers = headers_with_auth("Basic dXNlcjpwYXNz");
        let denied = check_auth(&mut headers, "secret").unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn wrong_token_yields_403() {
        let mut headers = headers_with_auth("Bearer not-the-token");
        let denied = check_auth(&mut headers, "secret").unwrap_err();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn valid_token_strips_the_header() {
        let mut headers = headers_with_auth("Bearer secret");
        check_auth(&mut headers, "secret").unwrap();
        assert!(!headers.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = headers_with_auth("bearer secret");
        check_auth(&mut headers, "secret").unwrap();
        assert!(!headers.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn gate_grants_burst_then_imposes_delay() {
        // 2 rps: half-second spacing, two immediate slots per burst window.
        let interval = Duration::from_millis(500);
        let burst_window = Duration::from_millis(500);
        let now = Instant::now();
        let mut schedule = now;

        assert_eq!(
            reserve_slot(&mut schedule, now, interval, burst_window),
            Duration::ZERO
        );
        assert_eq!(
            reserve_slot(&mut schedule, now, interval, burst_window),
            Duration::ZERO
        );
        assert_eq!(
            reserve_slot(&mut schedule, now, interval, burst_window),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn idle_gate_resets_instead_of_accumulating_capacity() {
        let interval = Duration::from_secs(1);
        let start = Instant::now();
        let mut schedule = start;

        let later = start + Duration::from_secs(30);
        assert_eq!(
            reserve_slot(&mut schedule, later, interval, Duration::ZERO),
            Duration::ZERO
        );
        assert_eq!(schedule, later + interval);
        assert_eq!(
            reserve_slot(&mut schedule, later, interval, Duration::ZERO),
            interval
        );
    }
}

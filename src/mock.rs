use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::httpclient;
use crate::snapshot::{HttpResponse, OutgoingRequest};

/// Replay-time stand-in for the service's third-party endpoints. Loaded from
/// a snapshot's outgoing requests and keyed by `method:url`.
pub struct MockServer {
    state: Arc<MockState>,
    listener: Option<ListenerHandle>,
}

struct MockState {
    expectations: BTreeMap<String, OutgoingRequest>,
    calls: Mutex<Vec<RecordedCall>>,
}

struct ListenerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

/// An intercepted inbound call, matched or not, kept for later validation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub response: Option<HttpResponse>,
}

impl MockServer {
    pub fn new(outgoing: &[OutgoingRequest]) -> Self {
        let expectations = outgoing
            .iter()
            .map(|call| (request_key(&call.method, &call.url), call.clone()))
            .collect();
        Self {
            state: Arc::new(MockState {
                expectations,
                calls: Mutex::new(Vec::new()),
            }),
            listener: None,
        }
    }

    /// Binds `127.0.0.1:0` and returns the chosen address.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock server")?;
        let addr = listener.local_addr().context("get mock local_addr")?;

        let state = Arc::clone(&self.state);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accept = listener.accept() => {
                        let Ok((stream, _peer)) = accept else { continue };
                        let io = TokioIo::new(stream);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                mock_handler(req, Arc::clone(&state))
                            });
                            let builder = ConnectionBuilder::new(TokioExecutor::new());
                            if let Err(err) = builder.serve_connection(io, service).await {
                                tracing::debug!("mock server connection error: {err}");
                            }
                        });
                    }
                }
            }
        });

        self.listener = Some(ListenerHandle {
            addr,
            shutdown_tx,
            join,
        });
        Ok(addr)
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.listener.take() {
            let _ = handle.shutdown_tx.send(());
            let _ = handle.join.await;
        }
    }

    /// Current bound address, or `None` before start.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|handle| handle.addr)
    }

    /// All calls the mock observed, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

async fn mock_handler(
    req: Request<Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let url = req.uri().to_string();
    let path = req.uri().path().to_owned();
    let headers = httpclient::joined_headers_filtered(req.headers(), &Default::default());

    let body = match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                })
            }
        }
        Err(err) => {
            tracing::error!("mock server failed to read request body: {err}");
            return Ok(json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from_static(br#"{"error": "failed to read request body"}"#),
            ));
        }
    };

    let expectation = find_expectation(&state.expectations, &method, &url, &path);

    let mut call = RecordedCall {
        method: method.clone(),
        url: url.clone(),
        headers,
        body,
        response: None,
    };

    let response = match expectation.and_then(|exp| exp.response.as_ref()) {
        Some(recorded) => {
            call.response = Some(recorded.clone());
            let body_bytes = if recorded.body.is_null() {
                Bytes::new()
            } else {
                match serde_json::to_vec(&recorded.body) {
                    Ok(data) => Bytes::from(data),
                    Err(err) => {
                        tracing::error!("mock server failed to serialize response body: {err}");
                        record_call(&state, call);
                        return Ok(json_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Bytes::from_static(br#"{"error": "failed to serialize response"}"#),
                        ));
                    }
                }
            };
            let status =
                StatusCode::from_u16(recorded.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            json_response(status, body_bytes)
        }
        None => {
            tracing::warn!(method = %method, url = %url, "unexpected outgoing request");
            json_response(
                StatusCode::BAD_GATEWAY,
                Bytes::from_static(br#"{"error": "no mock expectation matched"}"#),
            )
        }
    };

    record_call(&state, call);
    Ok(response)
}

/// Matching strategies in order: exact method+URL, method+path (covers
/// absolute-URL clients), then first expectation with the same method whose
/// key ends with the path.
fn find_expectation<'a>(
    expectations: &'a BTreeMap<String, OutgoingRequest>,
    method: &str,
    url: &str,
    path: &str,
) -> Option<&'a OutgoingRequest> {
    if let Some(exp) = expectations.get(&request_key(method, url)) {
        return Some(exp);
    }
    if let Some(exp) = expectations.get(&request_key(method, path)) {
        return Some(exp);
    }
    let method_prefix = format!("{method}:");
    expectations
        .iter()
        .find(|(key, _)| key.starts_with(&method_prefix) && key.ends_with(path))
        .map(|(_, exp)| exp)
}

fn record_call(state: &MockState, call: RecordedCall) {
    state
        .calls
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(call);
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn request_key(method: &str, url: &str) -> String {
    format!("{method}:{url}")
}

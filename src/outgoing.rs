use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderName};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::body;
use crate::httpclient::{self, HttpClient};
use crate::snapshot::{HttpResponse, OutgoingRequest};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward HTTP proxy the service under test routes its outgoing traffic
/// through (standard proxy-environment convention). Forwards each call,
/// captures request and response, and exposes a drain over the buffer.
pub struct OutgoingProxy {
    state: Arc<OutgoingState>,
    listener: Mutex<Option<ListenerHandle>>,
}

struct OutgoingState {
    calls: Mutex<Vec<OutgoingRequest>>,
    ignore_headers: HashSet<String>,
    client: HttpClient,
}

struct ListenerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl OutgoingProxy {
    pub fn new(ignore_headers: &[String]) -> anyhow::Result<Self> {
        let ignore_headers = ignore_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        Ok(Self {
            state: Arc::new(OutgoingState {
                calls: Mutex::new(Vec::new()),
                ignore_headers,
                client: httpclient::build_http_client()?,
            }),
            listener: Mutex::new(None),
        })
    }

    /// Binds on `127.0.0.1:port` (0 selects an ephemeral port) and returns
    /// the chosen address.
    pub async fn start(&self, port: u16) -> anyhow::Result<SocketAddr> {
        let bind_addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("bind outgoing proxy {bind_addr}"))?;
        let addr = listener.local_addr().context("get outgoing local_addr")?;

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
                                forward_handler(req, Arc::clone(&state))
                            });
                            let builder = ConnectionBuilder::new(TokioExecutor::new());
                            if let Err(err) = builder.serve_connection(io, service).await {
                                tracing::debug!("outgoing proxy connection error: {err}");
                            }
                        });
                    }
                }
            }
        });

        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ListenerHandle {
            addr,
            shutdown_tx,
            join,
        });
        Ok(addr)
    }

    pub async fn stop(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(());
            let _ = handle.join.await;
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|handle| handle.addr)
    }

    /// Atomically returns the captured buffer and resets it to empty.
    pub fn drain(&self) -> Vec<OutgoingRequest> {
        let mut calls = self
            .state
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *calls)
    }
}

async fn forward_handler(
    req: Request<Incoming>,
    state: Arc<OutgoingState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    // HTTPS tunneling is out of scope for capture.
    if req.method() == Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "HTTPS tunneling (CONNECT) not supported for outgoing capture; use plain HTTP",
        ));
    }

    let method = req.method().clone();
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let target_url = if req.uri().scheme().is_some() {
        req.uri().to_string()
    } else {
        let Some(host) = host else {
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "cannot determine forward target without an absolute URL or Host header",
            ));
        };
        format!("http://{host}{request_uri}")
    };

    let request_headers = req.headers().clone();
    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::error!("failed to read outgoing request body: {err}");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to read request body",
            ));
        }
    };

    let mut forward_headers = request_headers.clone();
    strip_hop_by_hop_headers(&mut forward_headers);

    let mut upstream_req = match Request::builder()
        .method(method.clone())
        .uri(target_url.as_str())
        .body(Full::new(body_bytes.clone()))
    {
        Ok(req) => req,
        Err(err) => {
            tracing::error!(url = %target_url, "failed to build forwarded request: {err}");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to create request",
            ));
        }
    };
    *upstream_req.headers_mut() = forward_headers;

    let upstream_res = match state.client.request(upstream_req).await {
        Ok(res) => res,
        Err(err) => {
            tracing::error!(url = %target_url, "failed to forward outgoing request: {err}");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                &format!("failed to reach upstream: {err}"),
            ));
        }
    };

    let upstream_status = upstream_res.status();
    let upstream_headers = upstream_res.headers().clone();
    let upstream_body = match upstream_res.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::error!(url = %target_url, "failed to read upstream response body: {err}");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to read response body",
            ));
        }
    };

    let request_content_type = content_type(&request_headers);
    let response_content_type = content_type(&upstream_headers);

    let captured = OutgoingRequest {
        method: method.to_string(),
        url: request_uri,
        headers: httpclient::joined_headers_filtered(&request_headers, &state.ignore_headers),
        body: body::parse_body(&body_bytes, &request_content_type),
        response: Some(HttpResponse {
            status: upstream_status.as_u16(),
            headers: httpclient::joined_headers_filtered(&upstream_headers, &state.ignore_headers),
            body: body::parse_body(&upstream_body, &response_content_type),
        }),
    };

    {
        let mut calls = state
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        calls.push(captured);
    }

    tracing::debug!(
        method = %method,
        url = %target_url,
        status = upstream_status.as_u16(),
        "outgoing request captured"
    );

    // Relay the upstream response verbatim.
    let mut response = Response::new(Full::new(upstream_body));
    *response.status_mut() = upstream_status;
    *response.headers_mut() = upstream_headers;
    Ok(response)
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Drops connection-scoped headers before a request or response crosses the
/// proxy: everything the Connection header names, the standard hop-by-hop
/// set, and the nonstandard proxy-connection.
pub(crate) fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in connection_listed.into_iter().chain(
        HOP_BY_HOP_HEADERS
            .iter()
            .map(|name| HeaderName::from_static(name)),
    ) {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::{BodyExt as _, Full};
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::client::legacy::{Client, connect::HttpConnector};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::OutgoingProxy;

    /// Tiny upstream that echoes a JSON body and a marker header.
    async fn spawn_upstream() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let seen_hop = req.headers().contains_key("proxy-authorization");
                        let mut response = Response::new(Full::new(Bytes::from(
                            serde_json::to_vec(&json!({"extra": "data", "saw_hop": seen_hop}))
                                .unwrap(),
                        )));
                        response.headers_mut().insert(
                            hyper::header::CONTENT_TYPE,
                            hyper::header::HeaderValue::from_static("application/json"),
                        );
                        Ok::<_, std::convert::Infallible>(response)
                    });
                    let _ = ConnectionBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
        addr
    }

    fn proxy_client() -> Client<HttpConnector, Full<Bytes>> {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        Client::builder(TokioExecutor::new()).build(connector)
    }

    #[tokio::test]
    async fn forwards_and_captures_an_outgoing_call() {
        let upstream_addr = spawn_upstream().await;
        let proxy = OutgoingProxy::new(&[]).unwrap();
        let proxy_addr = proxy.start(0).await.unwrap();

        // Origin-form request with a Host header naming the real upstream,
        // the way a proxy-env client reaches the forward proxy.
        let client = proxy_client();
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{proxy_addr}/"))
            .header(hyper::header::HOST, upstream_addr.to_string())
            .header("proxy-authorization", "Basic hop")
            .header("x-app", "kept")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = client.request(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["extra"], json!("data"));
        assert_eq!(
            parsed["saw_hop"],
            json!(false),
            "hop-by-hop headers must not reach the upstream"
        );

        let calls = proxy.drain();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "GET");
        assert_eq!(calls[0].url, "/");
        assert_eq!(calls[0].headers["x-app"], "kept");
        let response = calls[0].response.as_ref().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["extra"], json!("data"));

        proxy.stop().await;
    }

    #[tokio::test]
    async fn drain_resets_the_buffer() {
        let upstream_addr = spawn_upstream().await;
        let proxy = OutgoingProxy::new(&[]).unwrap();
        let proxy_addr = proxy.start(0).await.unwrap();

        let client = proxy_client();
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{proxy_addr}/enrich"))
            .header(hyper::header::HOST, upstream_addr.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();
        client.request(req).await.unwrap();

        assert_eq!(proxy.drain().len(), 1);
        assert!(proxy.drain().is_empty());

        proxy.stop().await;
    }

    #[tokio::test]
    async fn connect_method_is_rejected_with_405() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let proxy = OutgoingProxy::new(&[]).unwrap();
        let proxy_addr = proxy.start(0).await.unwrap();

        // CONNECT is tunnel-establishment, so drive it over a raw socket.
        let mut stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        let read = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..read]);
        assert!(
            response.starts_with("HTTP/1.1 405"),
            "unexpected response: {response}"
        );

        assert!(proxy.drain().is_empty());
        proxy.stop().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_502() {
        let proxy = OutgoingProxy::new(&[]).unwrap();
        let proxy_addr = proxy.start(0).await.unwrap();

        let client = proxy_client();
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{proxy_addr}/missing"))
            .header(hyper::header::HOST, "127.0.0.1:1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = client.request(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

        proxy.stop().await;
    }

    #[test]
    fn strip_removes_connection_listed_and_standard_hop_headers() {
        use hyper::header::HeaderValue;

        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            hyper::header::CONNECTION,
            HeaderValue::from_static("x-session-token, x-trace"),
        );
        headers.insert("x-session-token", HeaderValue::from_static("abc"));
        headers.insert("x-trace", HeaderValue::from_static("t1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-app", HeaderValue::from_static("kept"));

        super::strip_hop_by_hop_headers(&mut headers);

        assert!(!headers.contains_key("x-session-token"));
        assert!(!headers.contains_key("x-trace"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(!headers.contains_key("proxy-connection"));
        assert!(!headers.contains_key(hyper::header::CONNECTION));
        assert_eq!(headers.get("x-app").unwrap(), "kept");
    }

    #[tokio::test]
    async fn ignore_headers_are_filtered_from_capture() {
        let upstream_addr = spawn_upstream().await;
        let proxy = OutgoingProxy::new(&["X-Secret".to_owned()]).unwrap();
        let proxy_addr = proxy.start(0).await.unwrap();

        let client = proxy_client();
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{proxy_addr}/"))
            .header(hyper::header::HOST, upstream_addr.to_string())
            .header("x-secret", "value")
            .body(Full::new(Bytes::new()))
            .unwrap();
        client.request(req).await.unwrap();

        let calls = proxy.drain();
        assert!(!calls[0].headers.contains_key("x-secret"));

        proxy.stop().await;
    }
}

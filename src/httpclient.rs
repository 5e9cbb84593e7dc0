use std::collections::BTreeMap;
use std::sync::Once;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{HeaderMap, Request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;

use crate::body;
use crate::snapshot::{HttpRequest, HttpResponse};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

pub fn build_http_client() -> anyhow::Result<HttpClient> {
    // hyper-rustls needs a process-wide crypto provider before the first
    // connector is built. Another linked crate may have installed one
    // already, in which case ours is not needed.
    static CRYPTO_PROVIDER: Once = Once::new();
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
    });
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        anyhow::bail!("no rustls crypto provider available");
    }

    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("load system root certificates")?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Sends a recorded request against `base_url` and captures the parsed
/// response. Shared by the replay driver and the CLI update command.
pub async fn fire_request(
    base_url: &str,
    request: &HttpRequest,
    timeout_ms: u64,
) -> anyhow::Result<HttpResponse> {
    let client = build_http_client()?;
    let full_url = format!("{base_url}{}", request.url);

    let raw_body = body::decode_body(&request.body).context("decode request body")?;

    let mut builder = Request::builder()
        .method(request.method.as_str())
        .uri(full_url.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let http_request = builder
        .body(Full::new(Bytes::from(raw_body)))
        .with_context(|| format!("build request {} {full_url}", request.method))?;

    let response = tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        client.request(http_request),
    )
    .await
    .map_err(|_| anyhow::anyhow!("request timed out after {timeout_ms}ms"))?
    .with_context(|| format!("execute request {} {full_url}", request.method))?;

    let status = response.status().as_u16();
    let headers = single_valued_headers(response.headers());
    let content_type = response
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let body_bytes = response
        .into_body()
        .collect()
        .await
        .context("read response body")?
        .to_bytes();

    Ok(HttpResponse {
        status,
        headers,
        body: body::parse_body(&body_bytes, &content_type),
    })
}

/// Case-folded header map keeping the first value of each header.
pub fn single_valued_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            out.entry(name.as_str().to_owned())
                .or_insert_with(|| text.to_owned());
        }
    }
    out
}

/// Case-folded header map joining repeated values with `", "`, excluding
/// names in the ignore set (already lower-cased).
pub fn joined_headers_filtered(
    headers: &HeaderMap,
    ignored: &std::collections::HashSet<String>,
) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_owned();
        if ignored.contains(&key) {
            continue;
        }
        let Ok(text) = value.to_str() else { continue };
        out.entry(key)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(text);
            })
            .or_insert_with(|| text.to_owned());
    }
    out
}

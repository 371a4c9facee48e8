//! HTTP client that simulates how a chat front-end talks to the proxy

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;

use crate::types::{ProxyResponse, StreamResponse};

/// Build an HTTP client (no connection pooling for test isolation)
pub fn build_client() -> Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .pool_max_idle_per_host(0)
        .build()
        .expect("Failed to build reqwest client")
}

/// Value for the Authorization header
pub fn bearer(key: &str) -> String {
    format!("Bearer {key}")
}

/// POST a JSON body to `path`, collecting the streamed response as raw bytes
///
/// A mid-stream read error does not fail the call; it is reported in
/// `StreamResponse::error` together with the bytes received before it.
pub async fn send_stream(
    client: &Client,
    proxy_addr: &str,
    path: &str,
    authorization: Option<&str>,
    extra_headers: &[(&str, &str)],
    request_body: serde_json::Value,
) -> anyhow::Result<StreamResponse> {
    let url = format!("http://{proxy_addr}{path}");

    let mut req = client
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&request_body);
    if let Some(auth) = authorization {
        req = req.header("Authorization", auth);
    }
    for (name, value) in extra_headers {
        req = req.header(*name, *value);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send request to proxy: {}", e))?;

    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Collect all bytes from the stream
    let mut stream = resp.bytes_stream();
    let mut body: Vec<u8> = Vec::new();
    let mut error = None;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                let chunk: Bytes = chunk;
                body.extend_from_slice(&chunk);
            }
            Err(e) => {
                error = Some(e.to_string());
                break;
            }
        }
    }

    Ok(StreamResponse {
        status,
        content_type,
        body,
        error,
    })
}

/// Send a chat request to the proxy's /api/chat
pub async fn send_chat(
    client: &Client,
    proxy_addr: &str,
    authorization: Option<&str>,
    extra_headers: &[(&str, &str)],
    request_body: serde_json::Value,
) -> anyhow::Result<StreamResponse> {
    send_stream(client, proxy_addr, "/api/chat", authorization, extra_headers, request_body).await
}

/// Send a GET request to the proxy
pub async fn send_get(
    client: &Client,
    proxy_addr: &str,
    path: &str,
    authorization: Option<&str>,
) -> anyhow::Result<ProxyResponse> {
    let url = format!("http://{proxy_addr}{path}");

    let mut req = client.get(&url);
    if let Some(auth) = authorization {
        req = req.header("Authorization", auth);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to GET {}: {}", url, e))?;

    let status = resp.status().as_u16();
    let body_text = resp.text().await.unwrap_or_default();

    let body: serde_json::Value = serde_json::from_str(&body_text).unwrap_or(serde_json::Value::String(body_text));

    Ok(ProxyResponse { status, body })
}

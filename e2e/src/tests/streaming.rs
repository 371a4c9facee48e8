//! Tests for the streaming passthrough
//! Bytes reach the client exactly as the backend wrote them

use crate::backend::{self, queue_response};
use crate::client::{send_chat, send_stream};
use crate::runner::TestContext;
use crate::types::MockResponse;

use super::helpers::{assert_eq_val, assert_true, chat_chunk, chat_done, chat_request, settle_webhook};

/// A multi-record chat stream is relayed byte for byte, in order
pub async fn test_ndjson_relayed_unchanged(ctx: TestContext) -> anyhow::Result<()> {
    let records = vec![
        chat_chunk("The "),
        chat_chunk("sky "),
        chat_chunk("is "),
        chat_chunk("blue."),
        chat_done(12, 4),
    ];
    let expected: String = records.iter().map(|r| format!("{r}\n")).collect();
    queue_response(&ctx.backend_state, MockResponse::ndjson(records));

    let auth = ctx.auth();
    let resp = send_chat(&ctx.http_client, &ctx.proxy_addr, Some(&auth), &[], chat_request("Why is the sky blue?")).await?;

    assert_eq_val(resp.status, 200, "status")?;
    assert_true(resp.error.is_none(), &format!("unexpected stream error: {:?}", resp.error))?;
    assert_true(
        resp.content_type.contains("application/x-ndjson"),
        &format!("content type not preserved: {}", resp.content_type),
    )?;
    assert_eq_val(resp.text(), expected, "relayed body")?;
    assert_eq_val(resp.accumulated_content(), "The sky is blue.".to_string(), "content")
}

/// Records split across arbitrary chunk boundaries arrive intact
pub async fn test_records_split_across_chunks(ctx: TestContext) -> anyhow::Result<()> {
    let body = format!("{}\n{}\n", chat_chunk("Hello"), chat_done(3, 1));
    let (a, rest) = body.split_at(10);
    let (b, c) = rest.split_at(rest.len() / 2);
    queue_response(
        &ctx.backend_state,
        MockResponse::raw_chunks(vec![a.to_string(), b.to_string(), c.to_string()]),
    );

    let auth = ctx.auth();
    let resp = send_chat(&ctx.http_client, &ctx.proxy_addr, Some(&auth), &[], chat_request("hi")).await?;

    assert_eq_val(resp.status, 200, "status")?;
    assert_eq_val(resp.text(), body, "reassembled body")
}

/// The request body, path and query string reach the backend unchanged
pub async fn test_request_forwarded_unchanged(ctx: TestContext) -> anyhow::Result<()> {
    queue_response(&ctx.backend_state, MockResponse::ndjson(vec![chat_done(1, 1)]));

    let request = chat_request("forward me");
    let auth = ctx.auth();
    let resp = send_stream(
        &ctx.http_client,
        &ctx.proxy_addr,
        "/api/chat?keep_alive=5m",
        Some(&auth),
        &[],
        request.clone(),
    )
    .await?;
    assert_eq_val(resp.status, 200, "status")?;

    let received = backend::drain_requests(&ctx.backend_state);
    assert_eq_val(received.len(), 1, "backend request count")?;
    let req = &received[0];
    assert_eq_val(req.method.as_str(), "POST", "method")?;
    assert_eq_val(req.path.as_str(), "/api/chat", "path")?;
    assert_eq_val(req.query.as_deref(), Some("keep_alive=5m"), "query")?;
    assert_eq_val(&req.body, &request, "body")
}

/// Forwarding headers describe the original client connection
pub async fn test_forwarding_headers(ctx: TestContext) -> anyhow::Result<()> {
    queue_response(&ctx.backend_state, MockResponse::ndjson(vec![chat_done(1, 1)]));

    let auth = ctx.auth();
    send_chat(&ctx.http_client, &ctx.proxy_addr, Some(&auth), &[], chat_request("hi")).await?;

    let received = backend::drain_requests(&ctx.backend_state);
    assert_eq_val(received.len(), 1, "backend request count")?;
    let req = &received[0];

    let xff = req.header("x-forwarded-for").unwrap_or_default();
    assert_true(xff.contains("127.0.0.1"), &format!("X-Forwarded-For missing client ip: {:?}", xff))?;
    assert_eq_val(req.header("x-forwarded-proto"), Some("http"), "X-Forwarded-Proto")?;
    assert_eq_val(
        req.header("x-forwarded-host"),
        Some(ctx.proxy_addr.as_str()),
        "X-Forwarded-Host",
    )
}

/// Backend error statuses and bodies reach the client as-is
pub async fn test_error_status_passthrough(ctx: TestContext) -> anyhow::Result<()> {
    let error_body = r#"{"error":"model \"nope\" not found, try pulling it first"}"#;
    queue_response(&ctx.backend_state, MockResponse::error(404, error_body));

    let auth = ctx.auth();
    let resp = send_chat(&ctx.http_client, &ctx.proxy_addr, Some(&auth), &[], chat_request("hi")).await?;

    assert_eq_val(resp.status, 404, "status")?;
    assert_eq_val(resp.text(), error_body.to_string(), "error body")?;

    let events = settle_webhook(&ctx).await;
    assert_true(events.is_empty(), "error responses must not produce usage events")
}

/// A backend that dies mid-stream truncates the client stream and emits no event
pub async fn test_truncated_stream(ctx: TestContext) -> anyhow::Result<()> {
    let first = format!("{}\n", chat_chunk("partial"));
    let done = chat_done(10, 2);
    let cut = &done[..done.len() / 2];
    queue_response(
        &ctx.backend_state,
        MockResponse::truncated(vec![first.clone(), cut.to_string()]),
    );

    let auth = ctx.auth();
    let resp = send_chat(&ctx.http_client, &ctx.proxy_addr, Some(&auth), &[], chat_request("hi")).await?;

    assert_eq_val(resp.status, 200, "status")?;
    assert_true(resp.error.is_some(), "client should see the stream end with an error")?;
    assert_true(
        resp.text().starts_with(&first),
        &format!("complete records before the failure must be relayed, got {:?}", resp.text()),
    )?;

    let events = settle_webhook(&ctx).await;
    assert_true(
        events.is_empty(),
        &format!("incomplete terminal record must not produce an event, got {:?}", events),
    )
}

/// Paths the proxy does not know are still passed through
pub async fn test_unknown_path_passthrough(ctx: TestContext) -> anyhow::Result<()> {
    let auth = ctx.auth();
    let resp = crate::client::send_get(&ctx.http_client, &ctx.proxy_addr, "/api/tags", Some(&auth)).await?;
    assert_eq_val(resp.status, 200, "tags status")?;
    assert_eq_val(resp.get_str("models.0.name"), Some("llama3.2:latest"), "first model")?;

    let missing = crate::client::send_get(&ctx.http_client, &ctx.proxy_addr, "/does/not/exist", Some(&auth)).await?;
    assert_eq_val(missing.status, 404, "unknown path status")
}

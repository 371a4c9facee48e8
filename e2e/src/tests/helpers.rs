//! Common test helpers, Ollama record builders and assertions

use serde_json::{json, Value};
use std::time::Duration;

use crate::backend;
use crate::runner::TestContext;
use crate::types::WebhookEvent;

// ─── Request builders ────────────────────────────────────────────────────────

/// Build a streaming /api/chat request
pub fn chat_request(prompt: &str) -> Value {
    json!({
        "model": "llama3.2",
        "messages": [{"role": "user", "content": prompt}],
        "stream": true
    })
}

/// Build a streaming /api/generate request
pub fn generate_request(prompt: &str) -> Value {
    json!({
        "model": "llama3.2",
        "prompt": prompt,
        "stream": true
    })
}

// ─── Backend record builders ─────────────────────────────────────────────────

/// One intermediate chat record carrying `content`
pub fn chat_chunk(content: &str) -> String {
    json!({
        "model": "llama3.2",
        "created_at": "2024-05-01T10:00:00Z",
        "message": {"role": "assistant", "content": content},
        "done": false
    })
    .to_string()
}

/// The terminal chat record with usage counters
pub fn chat_done(prompt_eval_count: u64, eval_count: u64) -> String {
    json!({
        "model": "llama3.2",
        "created_at": "2024-05-01T10:00:05Z",
        "message": {"role": "assistant", "content": ""},
        "done": true,
        "done_reason": "stop",
        "total_duration": 5_000_000_000u64,
        "load_duration": 20_000_000u64,
        "prompt_eval_count": prompt_eval_count,
        "prompt_eval_duration": 100_000_000u64,
        "eval_count": eval_count,
        "eval_duration": 4_000_000_000u64
    })
    .to_string()
}

/// One intermediate /api/generate record
pub fn generate_chunk(response: &str) -> String {
    json!({
        "model": "llama3.2",
        "created_at": "2024-05-01T10:00:00Z",
        "response": response,
        "done": false
    })
    .to_string()
}

/// The terminal /api/generate record
pub fn generate_done(eval_count: u64) -> String {
    json!({
        "model": "llama3.2",
        "created_at": "2024-05-01T10:00:03Z",
        "response": "",
        "done": true,
        "done_reason": "stop",
        "context": [1, 2, 3],
        "total_duration": 3_000_000_000u64,
        "prompt_eval_count": 8,
        "eval_count": eval_count,
        "eval_duration": 2_000_000_000u64
    })
    .to_string()
}

// ─── Webhook polling ─────────────────────────────────────────────────────────

/// Poll the mock webhook until at least `count` events arrived or `timeout` passes
pub async fn wait_for_webhook_events(ctx: &TestContext, count: usize, timeout: Duration) -> Vec<WebhookEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let events = backend::webhook_events(&ctx.backend_state);
        if events.len() >= count || tokio::time::Instant::now() >= deadline {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Give the forwarder time to deliver anything it might have queued, then
/// return whatever arrived
pub async fn settle_webhook(ctx: &TestContext) -> Vec<WebhookEvent> {
    tokio::time::sleep(Duration::from_millis(500)).await;
    backend::webhook_events(&ctx.backend_state)
}

// ─── Assertion helpers ────────────────────────────────────────────────────────

/// Assert two values are equal, with context on failure
pub fn assert_eq_val<T: PartialEq + std::fmt::Debug>(actual: T, expected: T, label: &str) -> anyhow::Result<()> {
    if actual != expected {
        Err(anyhow::anyhow!("{label}: expected {:?} but got {:?}", expected, actual))
    } else {
        Ok(())
    }
}

/// Assert condition is true, with message
pub fn assert_true(cond: bool, msg: &str) -> anyhow::Result<()> {
    if !cond {
        Err(anyhow::anyhow!("{}", msg))
    } else {
        Ok(())
    }
}

//! Test registry - all test cases are registered here

pub mod helpers;
pub mod streaming;

use crate::runner::TestCase;

/// Build and return all test cases
///
/// Tests are grouped by category. Each test:
/// 1. Queues a mock backend response (what Ollama would stream)
/// 2. Sends a request to the REAL proxy
/// 3. Validates the response, what reached the backend, and what reached the webhook
pub fn all_tests() -> Vec<TestCase> {
    macro_rules! test {
        ($name:expr, $desc:expr, $func:path) => {
            TestCase {
                name: $name,
                description: $desc,
                run: Box::new(|ctx| Box::pin($func(ctx))),
            }
        };
    }

    vec![
        // ── Ping & preload ─────────────────────────────────────────────────────
        test!(
            "ping/ready",
            "Ping answers 200 once every configured model was pulled",
            ping::test_ping_ready
        ),
        test!(
            "ping/requires_key",
            "Ping without a key is refused with 401",
            ping::test_ping_requires_key
        ),
        test!(
            "ping/not_proxied",
            "Ping is answered by the proxy itself",
            ping::test_ping_not_proxied
        ),
        test!(
            "ping/preload_order",
            "Preload pulls models in configured order, past a failing one",
            ping::test_preload_pulled_in_order
        ),

        // ── Authorization ──────────────────────────────────────────────────────
        test!(
            "auth/missing_key",
            "Request without Authorization gets 401 and never reaches the backend",
            auth::test_missing_key_rejected
        ),
        test!(
            "auth/invalid_key",
            "Unknown bearer key gets 401",
            auth::test_invalid_key_rejected
        ),
        test!(
            "auth/malformed_header",
            "Wrong scheme, missing key or extra tokens get 401",
            auth::test_malformed_header_rejected
        ),
        test!(
            "auth/second_key",
            "Any configured key is accepted",
            auth::test_second_key_accepted
        ),
        test!(
            "auth/lenient_format",
            "Bearer scheme is case-insensitive and whitespace-tolerant",
            auth::test_lenient_bearer_format
        ),
        test!(
            "auth/not_forwarded",
            "Caller's Authorization header is never sent upstream",
            auth::test_credential_not_forwarded
        ),
        test!(
            "auth/check_endpoint",
            "Auth-check path answers 200 with a key and 401 without",
            auth::test_auth_check_endpoint
        ),

        // ── Streaming passthrough ──────────────────────────────────────────────
        test!(
            "streaming/relayed_unchanged",
            "NDJSON chat stream reaches the client byte for byte",
            streaming::test_ndjson_relayed_unchanged
        ),
        test!(
            "streaming/split_records",
            "Records split across chunks are reassembled unchanged",
            streaming::test_records_split_across_chunks
        ),
        test!(
            "streaming/request_unchanged",
            "Method, path, query and body reach the backend unchanged",
            streaming::test_request_forwarded_unchanged
        ),
        test!(
            "streaming/forwarding_headers",
            "X-Forwarded-For/Host/Proto describe the client connection",
            streaming::test_forwarding_headers
        ),
        test!(
            "streaming/error_status",
            "Backend error status and body pass through, no usage event",
            streaming::test_error_status_passthrough
        ),
        test!(
            "streaming/truncated",
            "Backend dying mid-stream truncates the client stream, no usage event",
            streaming::test_truncated_stream
        ),
        test!(
            "streaming/other_paths",
            "Non-completion paths are passed through",
            streaming::test_unknown_path_passthrough
        ),

        // ── Usage metrics ──────────────────────────────────────────────────────
        test!(
            "metrics/one_event",
            "Completed chat posts exactly one event with identity and counters",
            metrics::test_chat_produces_one_event
        ),
        test!(
            "metrics/anonymous",
            "Event without identity headers omits user fields",
            metrics::test_event_without_identity
        ),
        test!(
            "metrics/no_done",
            "Stream without a done record posts nothing",
            metrics::test_no_event_without_done
        ),
        test!(
            "metrics/generate",
            "/api/generate streams are metered too",
            metrics::test_generate_produces_event
        ),
    ]
}

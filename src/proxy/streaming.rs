//! Streaming relay of upstream response bodies
//!
//! The upstream body is copied to the client as it arrives. For JSON and
//! NDJSON bodies every newline-terminated record is also handed to an
//! observer after it has been queued for the client, which is how usage
//! metrics are read off a completion without delaying it.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::io;
use tokio::sync::mpsc;

use crate::api::CompletionRecord;
use crate::exporters::MetricsForwarder;
use crate::stats::{CallerIdentity, UserModelMetrics};

/// Client side of a relay: the proxied response body reads from the other end
pub type BodySender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Upstream finished cleanly
    Eof,
    /// Upstream failed mid-body; the client body was aborted
    UpstreamError,
    /// The client went away
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub bytes: u64,
    pub records: usize,
    pub end: RelayEnd,
}

impl RelaySummary {
    fn new() -> Self {
        Self {
            bytes: 0,
            records: 0,
            end: RelayEnd::Eof,
        }
    }
}

/// Check if Content-Type indicates a body made of JSON records
pub fn is_record_content_type(content_type: &str) -> bool {
    let ct_lower = content_type.to_lowercase();
    ct_lower.contains("application/json")
        || ct_lower.contains("application/x-ndjson")
        || (ct_lower.contains("application/vnd.") && ct_lower.contains("+json"))
}

/// Relay `upstream` line by line, calling `on_record` with each line (newline
/// stripped) once it has been queued for the client.
///
/// Only newline-terminated lines are records. Bytes left after the last
/// newline at EOF are forwarded to the client but never observed.
/// On an upstream error the incomplete line is forwarded but not observed,
/// then the error is passed on so the client sees a truncated body.
pub async fn relay_records<S, F>(upstream: S, sink: BodySender, mut on_record: F) -> RelaySummary
where
    S: Stream<Item = Result<Bytes, io::Error>>,
    F: FnMut(&[u8]),
{
    let mut upstream = std::pin::pin!(upstream);
    let mut summary = RelaySummary::new();
    let mut pending = BytesMut::new();

    while let Some(chunk) = upstream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    bytes = summary.bytes + pending.len() as u64,
                    "Upstream body failed mid-stream"
                );
                if !pending.is_empty() {
                    let partial = pending.split().freeze();
                    summary.bytes += partial.len() as u64;
                    let _ = sink.send(Ok(partial)).await;
                }
                let _ = sink.send(Err(e)).await;
                summary.end = RelayEnd::UpstreamError;
                return summary;
            }
        };

        // Only the new bytes can hold a newline
        let mut scan_from = pending.len();
        pending.extend_from_slice(&chunk);

        while let Some(offset) = pending[scan_from..].iter().position(|b| *b == b'\n') {
            let line = pending.split_to(scan_from + offset + 1).freeze();
            scan_from = 0;

            if sink.send(Ok(line.clone())).await.is_err() {
                summary.end = RelayEnd::ClientGone;
                return summary;
            }
            summary.bytes += line.len() as u64;
            summary.records += 1;
            on_record(&line[..line.len() - 1]);
        }
    }

    if !pending.is_empty() {
        let tail = pending.split().freeze();
        if sink.send(Ok(tail.clone())).await.is_err() {
            summary.end = RelayEnd::ClientGone;
            return summary;
        }
        summary.bytes += tail.len() as u64;
        tracing::debug!(bytes = tail.len(), "Upstream body ended without a trailing newline");
    }

    summary
}

/// Relay `upstream` chunk by chunk without looking inside
pub async fn relay_chunks<S>(upstream: S, sink: BodySender) -> RelaySummary
where
    S: Stream<Item = Result<Bytes, io::Error>>,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut summary = RelaySummary::new();

    while let Some(chunk) = upstream.next().await {
        match chunk {
            Ok(chunk) => {
                let len = chunk.len() as u64;
                if sink.send(Ok(chunk)).await.is_err() {
                    summary.end = RelayEnd::ClientGone;
                    return summary;
                }
                summary.bytes += len;
            }
            Err(e) => {
                tracing::warn!(error = %e, bytes = summary.bytes, "Upstream body failed mid-stream");
                let _ = sink.send(Err(e)).await;
                summary.end = RelayEnd::UpstreamError;
                return summary;
            }
        }
    }

    summary
}

/// Turns terminal completion records into usage events
pub struct UsageObserver {
    identity: CallerIdentity,
    forwarder: MetricsForwarder,
    events: usize,
}

impl UsageObserver {
    pub fn new(identity: CallerIdentity, forwarder: MetricsForwarder) -> Self {
        Self {
            identity,
            forwarder,
            events: 0,
        }
    }

    /// Number of usage events emitted so far
    pub fn events(&self) -> usize {
        self.events
    }

    pub fn observe(&mut self, record: &[u8]) {
        if record.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match serde_json::from_slice::<CompletionRecord>(record) {
            Ok(completion) if completion.done => {
                let event = UserModelMetrics::from_record(&completion, &self.identity);
                tracing::info!(
                    done_reason = completion.done_reason.as_deref().unwrap_or("-"),
                    "{}",
                    event.summary()
                );
                self.forwarder.submit(event);
                self.events += 1;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    preview = %String::from_utf8_lossy(&record[..record.len().min(200)]),
                    "Failed to decode upstream record"
                );
            }
        }
    }
}

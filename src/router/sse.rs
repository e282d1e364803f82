//! SSE stream normalization.
//!
//! Upstream TCP chunks can split an SSE record anywhere. The normalizer is a
//! pure repartitioner: it buffers the unterminated tail, emits every complete
//! line exactly as received (terminator included), and flushes any remainder
//! verbatim at end-of-stream. It never reorders, coalesces, or rewrites
//! payloads: concatenating its output always reproduces the input bytes.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{client_error_body, ErrorKind};

/// Repartition a byte stream into complete SSE lines.
pub fn normalize_sse_stream(
    inner: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures::stream::unfold(
        (Box::pin(inner), Vec::<u8>::new()),
        |(mut stream, mut buf)| async move {
            loop {
                // Emit the next complete line from the carry buffer.
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = buf.drain(..=pos).collect::<Vec<u8>>();
                    return Some((Ok(Bytes::from(line)), (stream, buf)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => {
                        return Some((Err(std::io::Error::other(e.to_string())), (stream, buf)));
                    }
                    None => {
                        // Stream ended — flush the unterminated remainder.
                        if buf.is_empty() {
                            return None;
                        }
                        let remainder = std::mem::take(&mut buf);
                        return Some((Ok(Bytes::from(remainder)), (stream, buf)));
                    }
                }
            }
        },
    )
}

/// What a completed (or failed) stream observed.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Whether a `usage` object was seen in any `data:` payload.
    pub saw_usage: bool,
    /// Whether the terminal `data: [DONE]` record was seen.
    pub saw_terminal: bool,
    pub errored: bool,
    pub received_any: bool,
}

/// Wrap a normalized line stream to watch for the usage chunk and terminal
/// record, invoking `on_complete` exactly once when the stream finishes.
///
/// A mid-stream error becomes a final `event: error` frame followed by end of
/// stream, per the streaming error contract. If the client disconnects the
/// wrapper is dropped before completion and `on_complete` never runs, so no
/// partial usage is credited.
pub fn observe_stream<F>(
    inner: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    on_complete: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    async_stream::stream! {
        let mut stream = std::pin::pin!(inner);
        let mut outcome = StreamOutcome::default();
        while let Some(item) = stream.next().await {
            match item {
                Ok(line) => {
                    outcome.received_any = true;
                    scan_line(&line, &mut outcome);
                    yield Ok(line);
                }
                Err(e) => {
                    outcome.errored = true;
                    let frame = format!(
                        "event: error\ndata: {}\n\n",
                        client_error_body(ErrorKind::Streaming, &e.to_string())
                    );
                    yield Ok(Bytes::from(frame));
                    break;
                }
            }
        }
        on_complete(outcome);
    }
}

fn scan_line(line: &[u8], outcome: &mut StreamOutcome) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    let Some(payload) = text.trim_end().strip_prefix("data: ") else {
        return;
    };
    if payload.trim() == "[DONE]" {
        outcome.saw_terminal = true;
        return;
    }
    let Ok(v) = serde_json::from_str::<serde_json::Value>(payload) else {
        return;
    };
    if let Some(usage) = v.get("usage") {
        if usage.is_object() {
            outcome.saw_usage = true;
            if let Some(pt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                outcome.input_tokens = pt;
            }
            if let Some(ct) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                outcome.output_tokens = ct;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, reqwest::Error>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect()
    }

    async fn collect_lines(parts: &[&str]) -> Vec<String> {
        let input = futures::stream::iter(chunks(parts));
        normalize_sse_stream(input)
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn record_split_across_chunks_is_reassembled() {
        // One event delivered as three TCP writes.
        let lines = collect_lines(&["data: {", "\"c\":\"he\"}\n", "\n"]).await;
        assert_eq!(lines, vec!["data: {\"c\":\"he\"}\n", "\n"]);
    }

    #[tokio::test]
    async fn multiple_records_in_one_chunk_emit_in_order() {
        let lines =
            collect_lines(&["data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n"]).await;
        assert_eq!(
            lines,
            vec![
                "data: {\"a\":1}\n",
                "\n",
                "data: {\"b\":2}\n",
                "\n",
                "data: [DONE]\n",
                "\n",
            ]
        );
    }

    #[tokio::test]
    async fn event_lines_and_blank_lines_are_preserved() {
        let lines = collect_lines(&["event: error\ndata: {\"x\":1}\n\n"]).await;
        assert_eq!(lines, vec!["event: error\n", "data: {\"x\":1}\n", "\n"]);
    }

    #[tokio::test]
    async fn trailing_bytes_without_newline_flush_at_eof() {
        let lines = collect_lines(&["data: partial"]).await;
        assert_eq!(lines, vec!["data: partial"]);
    }

    #[tokio::test]
    async fn normalization_is_a_pure_repartition() {
        let parts = ["data: {\"a\"", ":1}\n", "\nda", "ta: [DONE]\n\n", "tail"];
        let lines = collect_lines(&parts).await;
        assert_eq!(lines.concat(), parts.concat());
    }

    #[tokio::test]
    async fn observe_records_usage_and_terminal() {
        let seen: Arc<Mutex<Option<StreamOutcome>>> = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);

        let input = futures::stream::iter(chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        ]));
        let observed = observe_stream(normalize_sse_stream(input), move |outcome| {
            *seen_cb.lock().unwrap() = Some(outcome);
        });
        let _output: Vec<_> = observed.collect().await;

        let outcome = seen.lock().unwrap().clone().unwrap();
        assert!(outcome.saw_usage);
        assert!(outcome.saw_terminal);
        assert_eq!(outcome.input_tokens, 5);
        assert_eq!(outcome.output_tokens, 3);
        assert!(!outcome.errored);
    }

    #[tokio::test]
    async fn mid_stream_error_yields_terminal_error_frame() {
        let seen: Arc<Mutex<Option<StreamOutcome>>> = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);

        let input = futures::stream::iter(vec![
            Ok(Bytes::from("data: {\"a\":1}\n".to_string())),
            Err(std::io::Error::other("connection reset")),
        ]);
        let observed = observe_stream(input, move |outcome| {
            *seen_cb.lock().unwrap() = Some(outcome);
        });
        let output: Vec<String> = observed
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await;

        let last = output.last().unwrap();
        assert!(last.starts_with("event: error\ndata: "));
        assert!(last.contains("\"streaming_error\""));
        assert!(last.ends_with("\n\n"));

        let outcome = seen.lock().unwrap().clone().unwrap();
        assert!(outcome.errored);
    }

    #[tokio::test]
    async fn dropped_stream_never_invokes_completion() {
        let seen: Arc<Mutex<Option<StreamOutcome>>> = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);

        let input = futures::stream::iter(chunks(&["data: {\"a\":1}\n\n", "data: [DONE]\n\n"]));
        let mut observed = Box::pin(observe_stream(normalize_sse_stream(input), move |outcome| {
            *seen_cb.lock().unwrap() = Some(outcome);
        }));
        // Client disconnect: read one line, then drop the stream.
        let _ = observed.next().await;
        drop(observed);

        assert!(seen.lock().unwrap().is_none());
    }
}

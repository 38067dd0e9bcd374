//! SSE-aware streaming de-anonymization.
//!
//! Streaming LLM APIs deliver one or two characters per `text_delta` event,
//! so a single token like `[PII_EMAIL_c160f8cc]` frequently arrives split
//! across multiple SSE events:
//!
//! ```text
//! data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"[PII_EMA"}}
//! data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"IL_c160f8cc]"}}
//! ```
//!
//! Raw byte replacement on the SSE envelope cannot match tokens split this
//! way. [`SseRewriter`] therefore reassembles upstream bytes into lines,
//! accumulates the text content of consecutive delta events, and only flushes
//! the prefix of the accumulator that cannot still be the start of a pending
//! token. The rewriter is sans-IO; [`deanonymize_body`] bridges it to a
//! hyper streaming body with a single task that owns both the upstream reader
//! and the outgoing channel, holding no locks across I/O.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use veil_core::TokenReplacer;

use crate::handler::ProxyBody;

/// Retained accumulator window. The longest possible token is
/// `[PII_CREDITCARD_XXXXXXXX]` at 25 bytes; one byte of margin covers a
/// bracket arriving at the window edge.
pub const TOKEN_SUFFIX_LEN: usize = 26;

/// Upstream read idle timeout; a silent upstream ends the stream.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Incremental SSE token rewriter.
///
/// Feed arbitrary byte chunks through [`push`](Self::push) and drain the end
/// of stream with [`finish`](Self::finish). Output bytes preserve upstream
/// ordering; synthetic flush events appear at the point of the event that
/// forced them.
pub struct SseRewriter {
    replacer: TokenReplacer,
    line_buf: Vec<u8>,
    accum: String,
}

impl SseRewriter {
    pub fn new(replacer: TokenReplacer) -> Self {
        Self {
            replacer,
            line_buf: Vec::new(),
            accum: String::new(),
        }
    }

    /// Consumes a chunk of upstream bytes, appending any output to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line_buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.process_line(&line, out);
            } else {
                self.line_buf.push(byte);
            }
        }
    }

    /// Flushes any partial line and pending accumulator at end of stream.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.line_buf.is_empty() {
            // The source had no trailing newline; don't append one.
            let line = std::mem::take(&mut self.line_buf);
            out.extend_from_slice(
                self.replacer
                    .replace(&String::from_utf8_lossy(&line))
                    .as_bytes(),
            );
        }
        self.flush_accum(out);
    }

    fn process_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        // SSE comment or blank separator: pass through verbatim.
        if line.is_empty() || line[0] == b':' {
            out.extend_from_slice(line);
            out.push(b'\n');
            return;
        }

        // Only "data: ..." lines carry a JSON payload.
        if !line.starts_with(b"data: ") {
            out.extend_from_slice(
                self.replacer
                    .replace(&String::from_utf8_lossy(line))
                    .as_bytes(),
            );
            out.push(b'\n');
            return;
        }

        let payload = &line[b"data: ".len()..];
        let mut event: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => {
                // Not valid JSON (e.g. "[DONE]"): replace and pass through.
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(
                    self.replacer
                        .replace(&String::from_utf8_lossy(payload))
                        .as_bytes(),
                );
                out.push(b'\n');
                return;
            }
        };

        if Self::is_text_delta(&event) {
            let text = event["delta"]["text"].as_str().unwrap_or_default();
            self.accum.push_str(text);

            let flush_up_to = self.flush_boundary();
            let replaced = self.replacer.replace(&self.accum[..flush_up_to]);
            let remaining = self.accum[flush_up_to..].to_string();

            if let Some(delta) = event.get_mut("delta").and_then(|d| d.as_object_mut()) {
                delta.insert("text".to_string(), Value::String(replaced));
            }
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    out.extend_from_slice(b"data: ");
                    out.extend_from_slice(&payload);
                    out.push(b'\n');
                    self.accum = remaining;
                }
                Err(_) => {
                    // Serialization failure: emit the original line unchanged
                    // and drop the accumulated text rather than duplicating it
                    // later.
                    out.extend_from_slice(line);
                    out.push(b'\n');
                    self.accum.clear();
                }
            }
            return;
        }

        // Any other event: flush pending text first so ordering is preserved,
        // then pass the event through the replacer. The prior delta event has
        // already been emitted and cannot be amended, so the flushed text
        // travels in a synthetic delta of its own.
        self.flush_accum(out);
        out.extend_from_slice(
            self.replacer
                .replace(&String::from_utf8_lossy(line))
                .as_bytes(),
        );
        out.push(b'\n');
    }

    fn is_text_delta(event: &Value) -> bool {
        if event.get("type").and_then(|t| t.as_str()) != Some("content_block_delta") {
            return false;
        }
        matches!(
            event
                .get("delta")
                .and_then(|d| d.get("type"))
                .and_then(|t| t.as_str()),
            Some("text_delta") | Some("thinking_delta")
        )
    }

    /// How much of the accumulator is safe to flush: everything except a
    /// trailing window that could still be the prefix of a split token.
    /// An unbalanced `[` inside the window pins the boundary to the bracket.
    fn flush_boundary(&self) -> usize {
        let bytes = self.accum.as_bytes();
        let len = bytes.len();
        if len <= TOKEN_SUFFIX_LEN {
            return 0;
        }
        let mut cut = len - TOKEN_SUFFIX_LEN;
        for i in (cut..len).rev() {
            if bytes[i] == b'[' {
                if !bytes[i..].contains(&b']') {
                    cut = i;
                }
                break;
            }
        }
        // Byte window; back down to a character boundary for slicing.
        while !self.accum.is_char_boundary(cut) {
            cut -= 1;
        }
        cut
    }

    fn flush_accum(&mut self, out: &mut Vec<u8>) {
        if self.accum.is_empty() {
            return;
        }
        let flushed = self.replacer.replace(&self.accum);
        self.accum.clear();
        if flushed.is_empty() {
            return;
        }
        let synth = serde_json::json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "text_delta", "text": flushed},
        });
        if let Ok(payload) = serde_json::to_vec(&synth) {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(&payload);
            out.extend_from_slice(b"\n\n");
        }
    }
}

/// Wraps an upstream response body in a streaming rewriter.
///
/// One spawned task owns the upstream reader and the channel sender; the
/// client reads the receiver end as the response body. The task takes its
/// replacer by value (a session snapshot), so a concurrent session delete
/// cannot race with it.
pub fn deanonymize_body(mut body: Incoming, replacer: TokenReplacer) -> ProxyBody {
    let (tx, rx) = mpsc::channel::<std::result::Result<Frame<Bytes>, Infallible>>(16);

    tokio::spawn(async move {
        let mut rewriter = SseRewriter::new(replacer);
        loop {
            let frame = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, body.frame()).await {
                Err(_) => {
                    tracing::debug!("upstream stream idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!("upstream stream read error: {}", e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let Ok(data) = frame.into_data() else {
                continue; // trailers
            };
            let mut out = Vec::new();
            rewriter.push(&data, &mut out);
            if !out.is_empty() && tx.send(Ok(Frame::data(Bytes::from(out)))).await.is_err() {
                return; // client went away
            }
        }

        let mut out = Vec::new();
        rewriter.finish(&mut out);
        if !out.is_empty() {
            let _ = tx.send(Ok(Frame::data(Bytes::from(out)))).await;
        }
    });

    BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veil_core::{Anonymizer, AnonymizerConfig, MemoryStore};

    fn anonymizer() -> Anonymizer {
        Anonymizer::new(
            AnonymizerConfig {
                use_ai: false,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            None,
        )
        .unwrap()
    }

    fn feed_byte_at_a_time(rewriter: &mut SseRewriter, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for b in input {
            rewriter.push(std::slice::from_ref(b), &mut out);
        }
        rewriter.finish(&mut out);
        out
    }

    #[test]
    fn sse_line_round_trips_byte_at_a_time() {
        let anon = anonymizer();
        let original =
            "data: {\"content\":\"call alice@example.com or +1-800-555-1234\"}\n\n";
        let masked = anon.anonymize_text(original, "s3");
        assert!(!masked.contains("alice@example.com"));

        let mut rewriter = SseRewriter::new(anon.session_replacer("s3"));
        let out = feed_byte_at_a_time(&mut rewriter, masked.as_bytes());
        assert_eq!(String::from_utf8(out).unwrap(), original);
    }

    #[test]
    fn plain_text_round_trips_byte_at_a_time() {
        let anon = anonymizer();
        let original = "ssn 123-45-6789 and mail alice@example.com\n";
        let masked = anon.anonymize_text(original, "s1");

        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));
        let out = feed_byte_at_a_time(&mut rewriter, masked.as_bytes());
        assert_eq!(String::from_utf8(out).unwrap(), original);
    }

    #[test]
    fn token_split_across_delta_events_is_reassembled() {
        let anon = anonymizer();
        // The whole input is the email, so the result is the bare token.
        let token = anon.anonymize_text("alice@example.com", "s1");
        assert!(token.starts_with("[PII_EMAIL_"));

        // Split the token mid-way across two delta events plus a trailing
        // stop event that forces the final flush.
        let (head, tail) = token.split_at(8);
        let input = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\n",
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":head}}),
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":tail}}),
            serde_json::json!({"type":"message_stop"}),
        );

        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));
        let out = feed_byte_at_a_time(&mut rewriter, input.as_bytes());
        let text = String::from_utf8(out).unwrap();

        assert!(
            text.contains("alice@example.com"),
            "token not reassembled: {text}"
        );
        assert!(!text.contains(&token), "token leaked unreplaced: {text}");
    }

    #[test]
    fn delta_text_is_accumulated_and_replaced() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let token = anon.anonymize_text("alice@example.com", "s1");

        // Single event containing the whole token plus padding so the flush
        // window lets the token through.
        let padding = "x".repeat(40);
        let input = format!(
            "data: {}\n\n",
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":format!("{token}{padding}")}}),
        );

        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));
        let mut out = Vec::new();
        rewriter.push(input.as_bytes(), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("alice@example.com"));
    }

    #[test]
    fn comment_and_blank_lines_pass_verbatim() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));

        let mut out = Vec::new();
        rewriter.push(b": heartbeat\n\n", &mut out);
        assert_eq!(out, b": heartbeat\n\n");
    }

    #[test]
    fn non_json_data_line_is_replaced_and_passed() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));

        let mut out = Vec::new();
        rewriter.push(b"data: [DONE]\n", &mut out);
        assert_eq!(out, b"data: [DONE]\n");
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));

        let mut out = Vec::new();
        rewriter.push(b": ping\r\n", &mut out);
        assert_eq!(out, b": ping\n");
    }

    #[test]
    fn non_delta_event_flushes_accumulator_as_synthetic_delta() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let token = anon.anonymize_text("alice@example.com", "s1");

        let input = format!(
            "data: {}\n\ndata: {}\n\n",
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":token}}),
            serde_json::json!({"type":"message_stop"}),
        );

        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));
        let mut out = Vec::new();
        rewriter.push(input.as_bytes(), &mut out);
        let text = String::from_utf8(out).unwrap();

        // The token was shorter than the suffix window, so it is withheld
        // from the delta and must arrive in a synthetic event before the
        // message_stop passthrough.
        let synth_at = text.find("alice@example.com").expect("flushed text");
        let stop_at = text.find("message_stop").expect("stop event");
        assert!(synth_at < stop_at, "synthetic flush must precede stop event");
    }

    #[test]
    fn trailing_window_is_retained_until_safe() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));

        // A delta ending in a fresh '[' must not flush the bracket.
        let input = format!(
            "data: {}\n",
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"some long preceding text then ["}}),
        );
        let mut out = Vec::new();
        rewriter.push(input.as_bytes(), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains('['), "unbalanced bracket escaped the window: {text}");
        assert_eq!(rewriter.accum.chars().last(), Some('['));
    }

    #[test]
    fn finish_flushes_partial_line_without_added_newline() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let token = anon.anonymize_text("alice@example.com", "s1");

        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));
        let mut out = Vec::new();
        rewriter.push(format!("tail {token}").as_bytes(), &mut out);
        assert!(out.is_empty());
        rewriter.finish(&mut out);
        assert_eq!(String::from_utf8(out).unwrap(), "tail alice@example.com");
    }

    #[test]
    fn multibyte_text_never_splits_mid_character() {
        let anon = anonymizer();
        anon.anonymize_text("alice@example.com", "s1");
        let mut rewriter = SseRewriter::new(anon.session_replacer("s1"));

        // 40+ bytes of multibyte text pushes the flush boundary into the
        // middle of the string; the boundary must land between characters.
        let text = "héllö wörld → ".repeat(4);
        let input = format!(
            "data: {}\n",
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":text}}),
        );
        let mut out = Vec::new();
        rewriter.push(input.as_bytes(), &mut out);
        let emitted = String::from_utf8(out).expect("output must stay valid UTF-8");
        assert!(emitted.starts_with("data: "));
    }
}

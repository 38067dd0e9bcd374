//! Two-stage PII detection and reversible tokenization.
//!
//! Detection runs in two stages per matched value:
//!  1. Fast regex pass for structured patterns (email, phone, SSN, …). Each
//!     pattern carries a confidence score; high-confidence matches are
//!     tokenized immediately.
//!  2. Per-value cache - consulted for each low-confidence match.
//!     Cache hit  → use the cached token.
//!     Cache miss → apply a deterministic fallback token immediately (PII is
//!                  never left unmasked), and dispatch an async sidecar task
//!                  to warm the cache for future requests.
//!
//! The cache is keyed by the original PII value, not by a hash of the
//! surrounding text: a recurring value (e.g. an IP address) gets a hit
//! regardless of which message body it appears in.
//!
//! An in-flight deduplication set prevents multiple concurrent tasks from
//! querying the sidecar for the same value.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cache::CacheStore;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pii::{self, Pattern, PiiKind};
use crate::session::{SessionMap, TokenReplacer};
use crate::sidecar::SidecarClient;

/// JSON object keys that are structural, not user content. String values
/// directly under these keys are never anonymized. The skip is shallow and by
/// key name only; recursion continues everywhere else.
const STRUCTURAL_KEYS: &[&str] = &["model", "temperature", "max_tokens", "top_p", "stream", "n"];

/// Fallback system instruction used when no model-family entry is configured.
const DEFAULT_PII_INSTRUCTION: &str =
    "PRIVACY TOKENS: This request contains privacy-preserving placeholders \
     matching the pattern [PII_TYPE_XXXXXXXX] where TYPE indicates the kind of \
     information (e.g. EMAIL, PHONE, SSN) and XXXXXXXX is an 8-character hex hash. \
     You MUST reproduce every such token EXACTLY as written in your response. \
     Do NOT replace them with example values or any other substitutes. \
     Treat [PII_*] tokens as opaque identifiers that must pass through unchanged.";

/// Construction options for [`Anonymizer`].
#[derive(Debug, Clone)]
pub struct AnonymizerConfig {
    pub sidecar_endpoint: String,
    pub sidecar_model: String,
    /// When false, every regex match is tokenized deterministically and the
    /// sidecar is never consulted.
    pub use_ai: bool,
    /// Matches with confidence at or above this threshold skip the cache and
    /// sidecar entirely.
    pub ai_threshold: f64,
    /// Sidecar concurrency limit. Warm-up tasks that cannot immediately
    /// acquire a slot are dropped, not queued.
    pub max_concurrent: usize,
    /// Model-family prefix → injected instruction; key `default` is the
    /// fallback.
    pub instructions: HashMap<String, String>,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            sidecar_endpoint: "http://localhost:11434".to_string(),
            sidecar_model: "qwen2.5:3b".to_string(),
            use_ai: true,
            ai_threshold: 0.7,
            max_concurrent: 1,
            instructions: HashMap::new(),
        }
    }
}

/// The PII detector and tokenizer.
///
/// Holds the compiled pattern table, the persistent value cache, the
/// per-request session maps, and the sidecar warm-up machinery. Cheap to
/// share behind an [`Arc`]; all methods take `&self`.
///
/// Warm-up dispatch spawns onto the ambient Tokio runtime, so when AI
/// detection is enabled the anonymizer must be driven from within one.
pub struct Anonymizer {
    patterns: Vec<Pattern>,
    sidecar: SidecarClient,
    use_ai: bool,
    ai_threshold: f64,
    instructions: HashMap<String, String>,

    cache: Arc<dyn CacheStore>,
    inflight: Arc<Mutex<HashSet<String>>>,
    semaphore: Arc<Semaphore>,

    sessions: SessionMap,
    metrics: Option<Arc<Metrics>>,
}

impl Anonymizer {
    /// Compiles the pattern table and assembles the detector. Pattern
    /// compilation failure is fatal.
    pub fn new(
        config: AnonymizerConfig,
        cache: Arc<dyn CacheStore>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let max_concurrent = config.max_concurrent.max(1);
        Ok(Self {
            patterns: pii::compile_patterns()?,
            sidecar: SidecarClient::new(&config.sidecar_endpoint, &config.sidecar_model),
            use_ai: config.use_ai,
            ai_threshold: config.ai_threshold,
            instructions: config.instructions,
            cache,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            sessions: SessionMap::new(),
            metrics,
        })
    }

    /// Replaces all detected PII in `text`, recording `token → original`
    /// under `session_id` for later de-anonymization.
    ///
    /// PII is never left unmasked: every match produces a token regardless of
    /// cache state or sidecar availability.
    pub fn anonymize_text(&self, text: &str, session_id: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut result = text.to_string();
        for pattern in &self.patterns {
            result = pattern
                .regex
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                    let token = self.token_for_match(pattern, matched);
                    if !session_id.is_empty() {
                        self.sessions.record(session_id, &token, matched);
                        if let Some(m) = &self.metrics {
                            Metrics::incr(&m.tokens_replaced);
                        }
                    }
                    token
                })
                .into_owned();
        }
        result
    }

    /// Returns the token for a single regex match.
    ///
    /// High-confidence patterns tokenize directly. Low-confidence patterns
    /// consult the persistent cache; on a miss a fallback token is applied
    /// immediately and a background sidecar dispatch warms the cache.
    fn token_for_match(&self, pattern: &Pattern, matched: &str) -> String {
        if !self.use_ai || pattern.confidence >= self.ai_threshold {
            return pii::token(pattern.kind, matched);
        }

        if let Some(cached) = self.cache.get(matched) {
            if let Some(m) = &self.metrics {
                Metrics::incr(&m.cache_hits);
            }
            return cached;
        }

        let token = pii::token(pattern.kind, matched);
        tracing::info!("low-confidence cache miss kind={}", pattern.kind);
        if let Some(m) = &self.metrics {
            Metrics::incr(&m.cache_misses);
            Metrics::incr(&m.cache_fallbacks);
        }
        self.dispatch_warmup(matched.to_string());
        token
    }

    /// Fires a background task to classify a single value via the sidecar
    /// and store the result in the value cache. The in-flight set prevents
    /// duplicate concurrent queries for the same value.
    ///
    /// The current request is unaffected: its fallback token has already been
    /// emitted. Warm-up tasks run to completion even if the originating
    /// client disconnects.
    fn dispatch_warmup(&self, original: String) {
        {
            let mut inflight = self.inflight.lock();
            if !inflight.insert(original.clone()) {
                return; // already in progress
            }
        }
        if let Some(m) = &self.metrics {
            Metrics::incr(&m.sidecar_dispatches);
        }

        let sidecar = self.sidecar.clone();
        let cache = self.cache.clone();
        let inflight = self.inflight.clone();
        let semaphore = self.semaphore.clone();
        let threshold = self.ai_threshold;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let _inflight = InflightGuard {
                inflight,
                original: original.clone(),
            };

            // Acquire a sidecar slot; drop the request if it is busy.
            let _permit = match semaphore.try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::info!("sidecar busy, skipping background query");
                    if let Some(m) = &metrics {
                        Metrics::incr(&m.sidecar_errors);
                    }
                    return;
                }
            };

            match sidecar.detect(&original).await {
                Ok(detections) => {
                    let mut stored = 0usize;
                    for d in &detections {
                        if d.original.is_empty() || d.confidence < threshold {
                            continue;
                        }
                        let Some(kind) = PiiKind::from_wire(&d.kind) else {
                            tracing::debug!("sidecar reported unknown kind {:?}", d.kind);
                            continue;
                        };
                        cache.set(&d.original, &pii::token(kind, &d.original));
                        stored += 1;
                    }
                    tracing::debug!("sidecar warm-up stored {} value(s)", stored);
                }
                Err(e) => {
                    tracing::info!("async sidecar query failed: {}", e);
                    if let Some(m) = &metrics {
                        Metrics::incr(&m.sidecar_errors);
                    }
                }
            }
        });
    }

    /// Parses `body` as JSON, anonymizes every string leaf (skipping
    /// structural keys), and injects the token-preservation instruction into
    /// the system prompt when any tokens were recorded. Non-JSON bodies are
    /// treated as plain text.
    pub fn anonymize_json(&self, body: &[u8], session_id: &str) -> Vec<u8> {
        let mut doc: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => {
                return self
                    .anonymize_text(&String::from_utf8_lossy(body), session_id)
                    .into_bytes();
            }
        };

        // Model name is read before the walk; the walk never rewrites it
        // (structural key), but the borrow has to end first.
        let model = doc
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        self.walk_value(&mut doc, session_id);

        if doc.is_object()
            && !session_id.is_empty()
            && self.sessions.token_count(session_id) > 0
        {
            let instruction = self.resolve_instruction(&model);
            Self::inject_instruction(&mut doc, &instruction);
        }

        match serde_json::to_vec(&doc) {
            Ok(out) => out,
            Err(_) => body.to_vec(),
        }
    }

    fn walk_value(&self, value: &mut Value, session_id: &str) {
        match value {
            Value::String(s) => {
                *s = self.anonymize_text(s, session_id);
            }
            Value::Array(items) => {
                for item in items {
                    self.walk_value(item, session_id);
                }
            }
            Value::Object(map) => {
                for (key, item) in map.iter_mut() {
                    if !STRUCTURAL_KEYS.contains(&key.as_str()) {
                        self.walk_value(item, session_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Appends `instruction` to the request's system prompt. Two API shapes
    /// are supported:
    ///
    ///   - top-level `system` field, either a string or an array of content
    ///     blocks;
    ///   - a `messages` array with a `role: "system"` entry (one is inserted
    ///     at the head when missing).
    ///
    /// Requests with neither shape (embeddings, completions) are left
    /// structurally unchanged.
    fn inject_instruction(doc: &mut Value, instruction: &str) {
        if instruction.is_empty() {
            return;
        }
        let Some(map) = doc.as_object_mut() else {
            return;
        };

        match map.get_mut("system") {
            Some(Value::String(s)) => {
                if s.is_empty() {
                    *s = instruction.to_string();
                } else {
                    s.push_str("\n\n");
                    s.push_str(instruction);
                }
                return;
            }
            Some(Value::Array(blocks)) => {
                blocks.push(serde_json::json!({
                    "type": "text",
                    "text": instruction,
                }));
                return;
            }
            _ => {}
        }

        if let Some(Value::Array(messages)) = map.get_mut("messages") {
            for message in messages.iter_mut() {
                let Some(msg) = message.as_object_mut() else {
                    continue;
                };
                if msg.get("role").and_then(|r| r.as_str()) == Some("system") {
                    if let Some(Value::String(content)) = msg.get_mut("content") {
                        if content.is_empty() {
                            *content = instruction.to_string();
                        } else {
                            content.push_str("\n\n");
                            content.push_str(instruction);
                        }
                    }
                    return;
                }
            }
            // No system message; prepend one.
            messages.insert(
                0,
                serde_json::json!({
                    "role": "system",
                    "content": instruction,
                }),
            );
        }
    }

    /// Returns the configured instruction for `model` using prefix matching,
    /// falling back to the `default` key, then the built-in instruction.
    fn resolve_instruction(&self, model: &str) -> String {
        for (key, instruction) in &self.instructions {
            if key == "default" {
                continue;
            }
            if model.starts_with(key.as_str()) {
                return instruction.clone();
            }
        }
        if let Some(fallback) = self.instructions.get("default") {
            return fallback.clone();
        }
        DEFAULT_PII_INSTRUCTION.to_string()
    }

    /// Reverses all token replacements recorded for the session.
    pub fn deanonymize_text(&self, text: &str, session_id: &str) -> String {
        let count = self.sessions.token_count(session_id);
        let restored = self.sessions.deanonymize_text(text, session_id);
        if count > 0 {
            if let Some(m) = &self.metrics {
                Metrics::add(&m.tokens_deanonymized, count as u64);
            }
        }
        restored
    }

    /// Number of tokens recorded for the session.
    pub fn session_token_count(&self, session_id: &str) -> usize {
        self.sessions.token_count(session_id)
    }

    /// Snapshot of the session's mappings, for the streaming response path.
    pub fn session_replacer(&self, session_id: &str) -> TokenReplacer {
        let replacer = self.sessions.snapshot(session_id);
        if !replacer.is_empty() {
            if let Some(m) = &self.metrics {
                Metrics::add(&m.tokens_deanonymized, replacer.len() as u64);
            }
        }
        replacer
    }

    /// Drops the session's mappings once its request completes.
    pub fn delete_session(&self, session_id: &str) {
        self.sessions.delete(session_id);
    }
}

/// Removes a value from the in-flight set when the warm-up task finishes,
/// on success and failure alike.
struct InflightGuard {
    inflight: Arc<Mutex<HashSet<String>>>,
    original: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn regex_only() -> Anonymizer {
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

    fn with_ai(cache: Arc<dyn CacheStore>) -> Anonymizer {
        Anonymizer::new(
            AnonymizerConfig {
                // Nothing listens here; warm-up failures must stay invisible
                // to the caller.
                sidecar_endpoint: "http://127.0.0.1:1".to_string(),
                use_ai: true,
                ..Default::default()
            },
            cache,
            None,
        )
        .unwrap()
    }

    #[test]
    fn anonymize_replaces_email_and_round_trips() {
        let anon = regex_only();
        let input = "Contact me at alice@example.com please";

        let out = anon.anonymize_text(input, "s1");
        assert!(!out.contains("alice@example.com"));
        assert!(out.contains("[PII_EMAIL_"));

        let restored = anon.deanonymize_text(&out, "s1");
        assert_eq!(restored, input);
    }

    #[test]
    fn anonymize_empty_text() {
        let anon = regex_only();
        assert_eq!(anon.anonymize_text("", "s1"), "");
        assert_eq!(anon.session_token_count("s1"), 0);
    }

    #[test]
    fn anonymize_multiple_kinds_round_trips() {
        let anon = regex_only();
        let input =
            "ssn 123-45-6789, card 4111 1111 1111 1111, ip 10.1.2.3, mail bob@corp.io, zip 94103";

        let out = anon.anonymize_text(input, "s1");
        for needle in [
            "123-45-6789",
            "4111 1111 1111 1111",
            "10.1.2.3",
            "bob@corp.io",
            "94103",
        ] {
            assert!(!out.contains(needle), "leaked {needle} in {out}");
        }

        assert_eq!(anon.deanonymize_text(&out, "s1"), input);
    }

    #[test]
    fn same_value_same_token_across_sessions() {
        let anon = regex_only();
        let a = anon.anonymize_text("alice@example.com", "a");
        let b = anon.anonymize_text("alice@example.com", "b");
        assert_eq!(a, b);
    }

    #[test]
    fn anonymized_output_is_stable_under_reanonymization() {
        let anon = regex_only();
        let once = anon.anonymize_text("reach me: alice@example.com / 123-45-6789", "s1");
        let twice = anon.anonymize_text(&once, "s2");
        assert_eq!(once, twice);
        assert_eq!(anon.session_token_count("s2"), 0);
    }

    #[test]
    fn json_body_is_walked_and_round_trips() {
        let anon = regex_only();
        let body = br#"{"model":"gpt-4","messages":[{"role":"user","content":"My SSN is 123-45-6789"}]}"#;

        let out = anon.anonymize_json(body, "s2");
        let parsed: Value = serde_json::from_slice(&out).unwrap();

        let text = String::from_utf8(out.clone()).unwrap();
        assert!(!text.contains("123-45-6789"));
        assert_eq!(parsed["model"], "gpt-4");

        // Every string leaf containing a token must restore.
        let content = parsed["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("[PII_SSN_"));
        assert_eq!(
            anon.deanonymize_text(content, "s2"),
            "My SSN is 123-45-6789"
        );
    }

    #[test]
    fn json_structural_keys_are_skipped() {
        let anon = regex_only();
        // "model" would otherwise match the phone/zip digit patterns.
        let body = br#"{"model":"555-867-5309","nested":{"model":"555-867-5309"},"text":"555-867-5309"}"#;

        let out = anon.anonymize_json(body, "s1");
        let parsed: Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(parsed["model"], "555-867-5309");
        // The skip is by key name at any depth.
        assert_eq!(parsed["nested"]["model"], "555-867-5309");
        assert_ne!(parsed["text"], "555-867-5309");
    }

    #[test]
    fn non_json_body_falls_back_to_text() {
        let anon = regex_only();
        let out = anon.anonymize_json(b"plain text with alice@example.com inside", "s1");
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("alice@example.com"));
    }

    #[test]
    fn instruction_injected_into_anthropic_string_system() {
        let anon = regex_only();
        let body = br#"{"model":"claude-3","system":"Be helpful.","messages":[{"role":"user","content":"mail alice@example.com"}]}"#;

        let out = anon.anonymize_json(body, "s1");
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let system = parsed["system"].as_str().unwrap();
        assert!(system.starts_with("Be helpful.\n\n"));
        assert!(system.contains("PRIVACY TOKENS"));
    }

    #[test]
    fn instruction_injected_into_anthropic_block_system() {
        let anon = regex_only();
        let body = br#"{"model":"claude-3","system":[{"type":"text","text":"Be helpful."}],"messages":[{"role":"user","content":"mail alice@example.com"}]}"#;

        let out = anon.anonymize_json(body, "s1");
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let blocks = parsed["system"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["type"], "text");
        assert!(blocks[1]["text"].as_str().unwrap().contains("PRIVACY TOKENS"));
    }

    #[test]
    fn instruction_appended_to_existing_system_message() {
        let anon = regex_only();
        let body = br#"{"model":"gpt-4","messages":[{"role":"system","content":"Be terse."},{"role":"user","content":"mail alice@example.com"}]}"#;

        let out = anon.anonymize_json(body, "s1");
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let content = parsed["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("Be terse.\n\n"));
        assert!(content.contains("PRIVACY TOKENS"));
    }

    #[test]
    fn instruction_prepends_system_message_when_missing() {
        let anon = regex_only();
        let body =
            br#"{"model":"gpt-4","messages":[{"role":"user","content":"mail alice@example.com"}]}"#;

        let out = anon.anonymize_json(body, "s1");
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let messages = parsed["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("PRIVACY TOKENS"));
    }

    #[test]
    fn no_injection_without_tokens() {
        let anon = regex_only();
        let body = br#"{"model":"gpt-4","messages":[{"role":"user","content":"just chatting"}]}"#;

        let out = anon.anonymize_json(body, "s1");
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let messages = parsed["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn no_injection_without_session() {
        let anon = regex_only();
        let body = br#"{"messages":[{"role":"user","content":"mail alice@example.com"}]}"#;

        let out = anon.anonymize_json(body, "");
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn instruction_resolution_prefers_model_prefix() {
        let mut instructions = HashMap::new();
        instructions.insert("claude".to_string(), "CLAUDE RULES".to_string());
        instructions.insert("default".to_string(), "DEFAULT RULES".to_string());
        let anon = Anonymizer::new(
            AnonymizerConfig {
                use_ai: false,
                instructions,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            None,
        )
        .unwrap();

        assert_eq!(anon.resolve_instruction("claude-sonnet-4"), "CLAUDE RULES");
        assert_eq!(anon.resolve_instruction("gpt-4"), "DEFAULT RULES");
    }

    #[tokio::test]
    async fn low_confidence_miss_is_masked_synchronously() {
        let anon = with_ai(Arc::new(MemoryStore::new()));
        let out = anon.anonymize_text("555-867-5309 is my number", "s1");
        assert!(!out.contains("555-867-5309"));
        assert!(out.contains("[PII_PHONE_"));
        assert_eq!(anon.deanonymize_text(&out, "s1"), "555-867-5309 is my number");
    }

    #[tokio::test]
    async fn low_confidence_uses_cached_token() {
        let cache = Arc::new(MemoryStore::new());
        cache.set("555-867-5309", "[PII_PHONE_cafecafe]");
        let anon = with_ai(cache);

        let out = anon.anonymize_text("call 555-867-5309", "s1");
        assert!(out.contains("[PII_PHONE_cafecafe]"));
        assert_eq!(anon.deanonymize_text(&out, "s1"), "call 555-867-5309");
    }

    #[tokio::test]
    async fn high_confidence_skips_cache() {
        let cache = Arc::new(MemoryStore::new());
        cache.set("alice@example.com", "[PII_EMAIL_cafecafe]");
        let anon = with_ai(cache);

        // Email confidence (0.95) is above the threshold, so the cached
        // token is not consulted.
        let out = anon.anonymize_text("alice@example.com", "s1");
        assert!(!out.contains("cafecafe"));
        assert!(out.contains("[PII_EMAIL_"));
    }

    #[tokio::test]
    async fn inflight_set_clears_after_dispatch() {
        let anon = with_ai(Arc::new(MemoryStore::new()));
        anon.anonymize_text("555-867-5309", "s1");
        // The warm-up task fails fast against the dead endpoint; the guard
        // must clear the in-flight entry either way.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if anon.inflight.lock().is_empty() {
                return;
            }
        }
        panic!("in-flight entry was never cleared");
    }
}

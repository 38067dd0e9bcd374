//! Per-request session maps for reversible tokenization.
//!
//! Each in-flight request owns one session: a mapping from emitted token back
//! to the original value it replaced. The outer map is shared by all request
//! handlers; inner maps are only ever written by the request that owns them.
//! Sessions are created just before anonymization and deleted when the
//! response completes, whether it succeeded, failed, or the client went away.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Shared token → original mappings, keyed by session id.
///
/// An empty session id disables recording entirely; every operation treats it
/// as a no-op. This lets passthrough requests share the code path without
/// allocating session state.
#[derive(Default)]
pub struct SessionMap {
    sessions: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `token → original` for the given session, creating the inner
    /// map lazily.
    pub fn record(&self, session_id: &str, token: &str, original: &str) {
        if session_id.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write();
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(token.to_string(), original.to_string());
    }

    /// Number of tokens recorded for the session. Zero for unknown or empty
    /// sessions.
    pub fn token_count(&self, session_id: &str) -> usize {
        if session_id.is_empty() {
            return 0;
        }
        self.sessions
            .read()
            .get(session_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Reverses every token replacement recorded for the session.
    pub fn deanonymize_text(&self, text: &str, session_id: &str) -> String {
        if session_id.is_empty() || text.is_empty() {
            return text.to_string();
        }
        let sessions = self.sessions.read();
        let Some(tokens) = sessions.get(session_id) else {
            return text.to_string();
        };
        let mut result = text.to_string();
        for (token, original) in tokens {
            result = result.replace(token, original);
        }
        result
    }

    /// Takes a snapshot of the session's mappings as a standalone replacer.
    ///
    /// The streaming response path runs in its own task and must keep
    /// replacing tokens after the owning handler has already deleted the
    /// session; the snapshot decouples it from that lifecycle.
    pub fn snapshot(&self, session_id: &str) -> TokenReplacer {
        if session_id.is_empty() {
            return TokenReplacer::empty();
        }
        let sessions = self.sessions.read();
        let pairs = sessions
            .get(session_id)
            .map(|m| {
                m.iter()
                    .map(|(t, o)| (t.clone(), o.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        TokenReplacer { pairs }
    }

    /// Removes the session's mappings. Safe to call for unknown sessions.
    pub fn delete(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        self.sessions.write().remove(session_id);
    }
}

/// An owned set of `token → original` substitutions.
///
/// Tokens are syntactically self-contained (`[PII_…]`) and never overlap one
/// another, so applying the pairs sequentially is order-independent.
#[derive(Debug, Clone, Default)]
pub struct TokenReplacer {
    pairs: Vec<(String, String)>,
}

impl TokenReplacer {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Applies every substitution to the input.
    pub fn replace(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (token, original) in &self.pairs {
            result = result.replace(token, original);
        }
        result
    }
}

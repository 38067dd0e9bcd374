//! HTTP client for the out-of-process PII classifier.
//!
//! The sidecar is a local model server (Ollama-compatible) consulted only for
//! low-confidence regex matches, and only from background warm-up tasks - the
//! request path never waits on it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Sidecar request timeout. Generous because small local models can be slow
/// to produce their first token.
const SIDECAR_TIMEOUT: Duration = Duration::from_secs(60);

/// One detection reported by the sidecar.
///
/// The kind is kept as the raw wire string here; callers resolve it through
/// [`crate::pii::PiiKind::from_wire`] and drop detections with kinds outside
/// the closed set.
#[derive(Debug, Clone, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub original: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for the sidecar's `/api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct SidecarClient {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl SidecarClient {
    pub fn new(endpoint: &str, model: &str) -> Self {
        // Building a client only fails if the TLS backend cannot initialize,
        // which is unrecoverable at startup.
        let client = reqwest::Client::builder()
            .timeout(SIDECAR_TIMEOUT)
            .build()
            .expect("sidecar HTTP client construction");
        Self {
            client,
            url: format!("{}/api/generate", endpoint.trim_end_matches('/')),
            model: model.to_string(),
        }
    }

    /// Sends one synchronous classification request and returns the parsed
    /// detections. Does not consult or update the cache; callers own cache
    /// management.
    pub async fn detect(&self, text: &str) -> Result<Vec<Detection>> {
        let prompt = format!(
            "Analyze the following text for PII (personally identifiable information).\n\
             Return ONLY a JSON array of detections. Each item must have:\n\
             - \"original\": the exact text found\n\
             - \"type\": one of: email, phone, ssn, creditCard, name, address, medical, salary, company, jobTitle, apiKey\n\
             - \"confidence\": float 0.0-1.0\n\n\
             Text to analyze:\n{text}\n\n\
             Return ONLY the JSON array, no explanation. \
             Example: [{{\"original\":\"John Smith\",\"type\":\"name\",\"confidence\":0.95}}]"
        );

        let resp = self
            .client
            .post(&self.url)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: GenerateResponse = resp.json().await?;
        Self::parse_detections(&body.response)
    }

    /// Extracts the first `[...]` substring from the model's free-form text
    /// response and parses it as a detection array.
    fn parse_detections(raw: &str) -> Result<Vec<Detection>> {
        let raw = raw.trim();
        let start = raw.find('[');
        let end = raw.rfind(']');
        let (Some(start), Some(end)) = (start, end) else {
            return Err(CoreError::Sidecar(
                "no JSON array in sidecar response".to_string(),
            ));
        };
        if end <= start {
            return Err(CoreError::Sidecar(
                "no JSON array in sidecar response".to_string(),
            ));
        }
        let detections: Vec<Detection> = serde_json::from_str(&raw[start..=end])?;
        Ok(detections)
    }
}

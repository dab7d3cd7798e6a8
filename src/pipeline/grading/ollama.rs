//! Local vision model over Ollama `/api/chat` (first fallback).
//!
//! Vision models report no confidence, so readings carry `None` and the
//! extractor scores them with the pattern heuristic.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::backend::{OcrBackend, OcrReading};
use super::GradeError;

const BACKEND_NAME: &str = "ollama_vision";

/// Reply the model gives when the band is blank.
const NO_GRADE_REPLY: &str = "NONE";

const GRADE_PROMPT: &str = "\
This image is the top strip of a graded student assignment. \
Transcribe the handwritten grade exactly as written, for example 8/10 or 7.5. \
Reply with the grade only. If no grade is written, reply NONE.";

pub struct OllamaVisionOcr {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaVisionOcr {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, GradeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GradeError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

/// Strip code fences and the no-grade reply from the model output.
fn clean_reply(reply: &str) -> String {
    let text = reply.trim().trim_matches('`').trim();
    if text.eq_ignore_ascii_case(NO_GRADE_REPLY) {
        String::new()
    } else {
        text.to_string()
    }
}

impl OcrBackend for OllamaVisionOcr {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn recognize(&self, png: &[u8]) -> Result<OcrReading, GradeError> {
        let _span = tracing::info_span!(
            "ollama_vision_ocr",
            model = %self.model,
            image_size = png.len(),
        )
        .entered();
        let start = std::time::Instant::now();

        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: GRADE_PROMPT,
                images: vec![base64::engine::general_purpose::STANDARD.encode(png)],
            }],
            stream: false,
        };

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            let reason = if e.is_connect() {
                format!("Cannot connect to Ollama at {}", self.base_url)
            } else if e.is_timeout() {
                format!("Request timed out after {}s", self.timeout_secs)
            } else {
                e.to_string()
            };
            GradeError::Ocr {
                backend: BACKEND_NAME.into(),
                reason,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GradeError::Ocr {
                backend: BACKEND_NAME.into(),
                reason: format!("HTTP {}: {body}", status.as_u16()),
            });
        }
        let parsed: ChatResponse = response.json().map_err(|e| GradeError::Ocr {
            backend: BACKEND_NAME.into(),
            reason: format!("Unreadable response: {e}"),
        })?;

        let text = clean_reply(&parsed.message.content);
        tracing::info!(
            model = %self.model,
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = text.len(),
            "Vision OCR complete"
        );
        Ok(OcrReading {
            text,
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_reply_means_blank() {
        assert_eq!(clean_reply("NONE"), "");
        assert_eq!(clean_reply("  none\n"), "");
        assert_eq!(clean_reply("```8/10```"), "8/10");
        assert_eq!(clean_reply(" 7.5 "), "7.5");
    }

    #[test]
    fn trailing_slash_trimmed_from_base_url() {
        let ocr = OllamaVisionOcr::new("http://localhost:11434/", "llava", 5).unwrap();
        assert_eq!(ocr.base_url, "http://localhost:11434");
        assert_eq!(ocr.name(), "ollama_vision");
    }

    #[test]
    fn unreachable_server_is_backend_failure() {
        // Port 9 (discard) is closed on test machines.
        let ocr = OllamaVisionOcr::new("http://127.0.0.1:9", "llava", 2).unwrap();
        assert!(matches!(ocr.recognize(b"png"), Err(GradeError::Ocr { .. })));
    }
}

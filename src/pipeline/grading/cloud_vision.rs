//! Google Cloud Vision `images:annotate` backend (primary).

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::backend::{OcrBackend, OcrReading};
use super::GradeError;

const BACKEND_NAME: &str = "cloud_vision";
const FEATURE: &str = "DOCUMENT_TEXT_DETECTION";

pub struct CloudVisionOcr {
    endpoint: String,
    api_key: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl CloudVisionOcr {
    pub fn new(endpoint: &str, api_key: &str, timeout_secs: u64) -> Result<Self, GradeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GradeError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            client,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: Vec<ImageRequest<'a>>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    image: ImageContent,
    features: Vec<Feature<'a>>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Deserialize)]
struct Page {
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Turn an annotate response body into a reading. An image without text is a
/// successful read of nothing.
fn parse_response(body: &str) -> Result<OcrReading, GradeError> {
    let parsed: AnnotateResponse = serde_json::from_str(body).map_err(|e| GradeError::Ocr {
        backend: BACKEND_NAME.into(),
        reason: format!("Unreadable response: {e}"),
    })?;
    let response = parsed.responses.into_iter().next().unwrap_or_default();
    if let Some(status) = response.error {
        return Err(GradeError::Ocr {
            backend: BACKEND_NAME.into(),
            reason: format!("API error {}: {}", status.code, status.message),
        });
    }
    Ok(match response.full_text_annotation {
        Some(annotation) => {
            let confidence = annotation
                .pages
                .first()
                .and_then(|p| p.confidence)
                .map(|c| c.clamp(0.0, 1.0));
            OcrReading {
                text: annotation.text.trim().to_string(),
                confidence,
            }
        }
        None => OcrReading {
            text: String::new(),
            confidence: None,
        },
    })
}

impl OcrBackend for CloudVisionOcr {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn recognize(&self, png: &[u8]) -> Result<OcrReading, GradeError> {
        let _span = tracing::info_span!("cloud_vision_ocr", image_size = png.len()).entered();
        let start = std::time::Instant::now();

        let body = AnnotateRequest {
            requests: vec![ImageRequest {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(png),
                },
                features: vec![Feature { kind: FEATURE }],
            }],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|e| GradeError::Ocr {
                backend: BACKEND_NAME.into(),
                reason: if e.is_timeout() {
                    format!("Request timed out after {}s", self.timeout_secs)
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(GradeError::Ocr {
                backend: BACKEND_NAME.into(),
                reason: format!("HTTP {}: {}", status.as_u16(), text.chars().take(200).collect::<String>()),
            });
        }

        let reading = parse_response(&text)?;
        tracing::info!(
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = reading.text.len(),
            confidence = ?reading.confidence,
            "Cloud vision OCR complete"
        );
        Ok(reading)
    }
}

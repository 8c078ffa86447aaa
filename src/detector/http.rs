use super::{Detection, Detector};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;

/// Detector backed by an HTTP inference service.
///
/// The frame is POSTed as the raw request body; the service answers with a
/// JSON array of `{"class": "...", "score": 0.0..1.0}` objects (COCO-SSD
/// style output, extra fields ignored).
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::InvalidConfig(format!("detector HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &[u8], max_results: usize) -> Result<Vec<Detection>> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("max_results", max_results)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(frame.to_vec())
            .send()
            .await
            .map_err(|e| BridgeError::AnalysisFailed(format!("detector request: {}", e)))?;

        if !response.status().is_success() {
            return Err(BridgeError::AnalysisFailed(format!(
                "detector returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::AnalysisFailed(format!("detector body: {}", e)))?;
        debug!("[Analysis] Detector response: {}", body);

        let mut detections = parse_detections(&body)?;
        detections.truncate(max_results);
        Ok(detections)
    }
}

fn parse_detections(body: &str) -> Result<Vec<Detection>> {
    let detections: Vec<Detection> = serde_json::from_str(body)
        .map_err(|e| BridgeError::AnalysisFailed(format!("malformed detector output: {}", e)))?;

    if let Some(bad) = detections.iter().find(|d| !d.score.is_finite()) {
        return Err(BridgeError::AnalysisFailed(format!(
            "non-finite score for class {}",
            bad.class
        )));
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coco_style_output() {
        let body = r#"[
            {"bbox": [1, 2, 3, 4], "class": "person", "score": 0.92},
            {"bbox": [5, 6, 7, 8], "class": "dog", "score": 0.41}
        ]"#;
        let detections = parse_detections(body).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class, "person");
    }

    #[test]
    fn test_malformed_output_is_analysis_failure() {
        assert!(matches!(
            parse_detections(r#"{"error": "model not loaded"}"#),
            Err(BridgeError::AnalysisFailed(_))
        ));
        assert!(matches!(
            parse_detections(r#"[{"class": "person"}]"#),
            Err(BridgeError::AnalysisFailed(_))
        ));
    }
}

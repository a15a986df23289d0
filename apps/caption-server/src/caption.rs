use crate::{
    error::ApiError,
    image_source::{decode_in_background, ImageReference, ImageSource},
};
use ai::{ImageCaptionInput, ImageCaptionModel, ModelLoader, DEFAULT_MAX_NEW_TOKENS};
use image_metrics::{ImageMetrics, MetricsConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration, time::Instant};

pub const MAX_NEW_TOKENS_LIMIT: usize = 512;

#[derive(Debug, Default, Deserialize)]
pub struct CaptionRequest {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    /// number or numeric string
    #[serde(default)]
    pub max_new_tokens: Option<Value>,
}

impl CaptionRequest {
    pub fn max_new_tokens(&self) -> usize {
        let requested = match &self.max_new_tokens {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        match requested {
            Some(n) if n.is_finite() && n >= 1.0 => (n as usize).min(MAX_NEW_TOKENS_LIMIT),
            _ => DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
    /// identifier of the backend that served the request
    pub model: String,
    /// whole request span: acquisition, loading, metrics and inference
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ImageMetrics>,
}

/// Coordinates one caption request against the shared model loader.
#[derive(Clone)]
pub struct CaptionService {
    loader: ModelLoader<ImageCaptionModel>,
    source: Arc<ImageSource>,
    /// `None` disables the metrics block
    metrics: Option<MetricsConfig>,
    /// Bounds the wait, not the work. A timed out job still occupies the
    /// backend worker until it finishes, so requests queued behind a wedged
    /// backend time out as well.
    inference_timeout: Duration,
}

impl CaptionService {
    pub fn new(
        loader: ModelLoader<ImageCaptionModel>,
        source: ImageSource,
        metrics: Option<MetricsConfig>,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            loader,
            source: Arc::new(source),
            metrics,
            inference_timeout,
        }
    }

    /// Image acquisition (then metrics) runs concurrently with model
    /// acquisition; inference waits for both.
    #[tracing::instrument(skip_all, err)]
    pub async fn caption(&self, request: CaptionRequest) -> Result<CaptionResponse, ApiError> {
        let started = Instant::now();

        let reference = ImageReference::from_request(
            request.image_url.as_deref(),
            request.image_base64.as_deref(),
        )?;
        let max_new_tokens = request.max_new_tokens();

        let image = async {
            let encoded = self.source.fetch(&reference).await?;
            let image = decode_in_background(encoded).await?;
            let metrics = self.metrics.map(|config| {
                let image = image.clone();
                tokio::task::spawn_blocking(move || image_metrics::extract_with(&image, config))
            });
            Ok::<_, ApiError>((image, metrics))
        };
        let model = async { self.loader.acquire().await.map_err(ApiError::from) };

        let ((image, metrics_task), model) = tokio::try_join!(image, model)?;
        tracing::debug!(model_id = %model.identifier, "model ready, running inference");

        let input = ImageCaptionInput::new(image).with_max_new_tokens(max_new_tokens);
        let inference = async {
            match tokio::time::timeout(self.inference_timeout, model.handle.process_single(input))
                .await
            {
                Ok(Ok(candidates)) => Ok(candidates),
                Ok(Err(e)) => Err(ApiError::Inference(format!("{:#}", e))),
                Err(_) => Err(ApiError::Inference(format!(
                    "timed out after {:?}",
                    self.inference_timeout
                ))),
            }
        };
        let metrics = async {
            match metrics_task {
                Some(task) => task
                    .await
                    .map(Some)
                    .map_err(|e| ApiError::Internal(format!("metrics computation failed: {}", e))),
                None => Ok(None),
            }
        };

        let (candidates, metrics) = tokio::try_join!(inference, metrics)?;

        let caption = candidates
            .into_iter()
            .next()
            .map(|candidate| candidate.generated_text)
            .unwrap_or_default();

        Ok(CaptionResponse {
            caption,
            model: model.identifier,
            latency_ms: started.elapsed().as_millis() as u64,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_tokens(value: Value) -> CaptionRequest {
        CaptionRequest {
            max_new_tokens: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn max_new_tokens_defaults_when_absent_or_invalid() {
        assert_eq!(CaptionRequest::default().max_new_tokens(), DEFAULT_MAX_NEW_TOKENS);
        for value in [json!("abc"), json!(0), json!(-5), json!(null), json!(true), json!([1])] {
            assert_eq!(with_tokens(value.clone()).max_new_tokens(), 40, "{value}");
        }
    }

    #[test]
    fn max_new_tokens_accepts_numbers_and_numeric_strings() {
        assert_eq!(with_tokens(json!(12)).max_new_tokens(), 12);
        assert_eq!(with_tokens(json!("64")).max_new_tokens(), 64);
        assert_eq!(with_tokens(json!(" 7 ")).max_new_tokens(), 7);
        assert_eq!(with_tokens(json!(20.9)).max_new_tokens(), 20);
    }

    #[test]
    fn max_new_tokens_is_clamped() {
        assert_eq!(with_tokens(json!(100_000)).max_new_tokens(), MAX_NEW_TOKENS_LIMIT);
        assert_eq!(with_tokens(json!("1e9")).max_new_tokens(), MAX_NEW_TOKENS_LIMIT);
    }

    #[test]
    fn request_body_fields_are_optional() {
        let request: CaptionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.image_url.is_none());
        assert!(request.image_base64.is_none());

        let request: CaptionRequest =
            serde_json::from_str(r#"{"image_url": null, "image_base64": "abc"}"#).unwrap();
        assert_eq!(request.image_base64.as_deref(), Some("abc"));
    }
}

use super::AIModel;
use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 40;

/// Decoded pixels are the canonical input shape for caption backends.
/// The image is shared with other per-request consumers so it is decoded once.
#[derive(Debug, Clone)]
pub struct ImageCaptionInput {
    pub image: Arc<DynamicImage>,
    pub max_new_tokens: usize,
}

impl ImageCaptionInput {
    pub fn new(image: Arc<DynamicImage>) -> Self {
        Self {
            image,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptionCandidate {
    pub generated_text: String,
}

/// Ordered candidates, best first. Backends may return none.
pub type ImageCaptionOutput = Vec<CaptionCandidate>;
pub type ImageCaptionModel = AIModel<ImageCaptionInput, ImageCaptionOutput>;

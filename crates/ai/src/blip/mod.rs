use crate::traits::{CaptionCandidate, ImageCaptionInput, ImageCaptionOutput};
use crate::Model;
use anyhow::{anyhow, bail};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip::VisionConfig;
use candle_transformers::models::{blip, blip_text};
use image::DynamicImage;
use std::path::Path;
use strum_macros::AsRefStr;
use tokenizers::Tokenizer;
use tracing::debug;

pub const MODEL_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const IMAGE_SIZE: u32 = 384;

pub struct BLIP {
    tokenizer: Tokenizer,
    model: blip::BlipForConditionalGeneration,
    logits_processor: LogitsProcessor,
    device: Device,
}

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: IMAGE_SIZE as usize,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum BLIPModel {
    Base,
    Large,
}

impl BLIPModel {
    /// Pick the BLIP configuration for a backend identifier such as
    /// `Salesforce/blip-image-captioning-large`. `None` for other families.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let identifier = identifier.to_ascii_lowercase();
        if !identifier.contains("blip") {
            return None;
        }
        if identifier.contains("large") {
            Some(Self::Large)
        } else {
            Some(Self::Base)
        }
    }

    fn config(&self) -> blip::Config {
        match self {
            Self::Base => blip_base_config(),
            Self::Large => blip::Config::image_captioning_large(),
        }
    }
}

impl Model for BLIP {
    type Item = ImageCaptionInput;
    type Output = ImageCaptionOutput;

    fn batch_size_limit(&self) -> usize {
        1
    }

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        if items.len() > self.batch_size_limit() {
            bail!("too many items");
        }

        let mut results = vec![];

        for item in items {
            let res = self
                .get_caption(&item.image, item.max_new_tokens)
                .map(|text| vec![CaptionCandidate { generated_text: text }]);
            results.push(res);
        }

        Ok(results)
    }
}

impl BLIP {
    /// Build the model from local artifacts. This is blocking work, callers
    /// on an async runtime should move it to a blocking thread.
    pub fn new(
        model_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        model_type: BLIPModel,
    ) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to initialize tokenizer: {}", e))?;

        let logits_processor = LogitsProcessor::new(1337, None, None);

        let config = model_type.config();
        let device = Device::Cpu;

        debug!(
            "loading BLIP {} weights from {}",
            model_type.as_ref(),
            model_path.as_ref().display()
        );
        // SAFETY: the weights file is only read, and it lives in the model cache
        // which nothing rewrites in place.
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[model_path.as_ref()], DType::F32, &device)?
        };
        let model = blip::BlipForConditionalGeneration::new(&config, vb)?;

        Ok(Self {
            tokenizer,
            model,
            logits_processor,
            device,
        })
    }

    fn get_caption(&mut self, image: &DynamicImage, max_new_tokens: usize) -> anyhow::Result<String> {
        debug!(
            "generating caption for {}x{} image, max {} tokens",
            image.width(),
            image.height(),
            max_new_tokens
        );
        let image = load_image(image)?.to_device(&self.device)?;
        let image_embeds = image.unsqueeze(0)?.apply(self.model.vision_model())?;

        let mut token_ids = vec![BOS_TOKEN_ID];

        // we need this to make multi time generation work
        self.model.text_decoder().reset_kv_cache();

        for index in 0..max_new_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        let result = self.tokenizer.decode(&token_ids, true);

        result
            .map(|v| v.trim().to_string())
            .map_err(|e| anyhow!("failed to generate caption: {}", e))
    }
}

/// Resize and normalise to the (3, 384, 384) tensor BLIP expects.
pub fn load_image(image: &DynamicImage) -> candle_core::Result<Tensor> {
    let img = image.resize_to_fill(IMAGE_SIZE, IMAGE_SIZE, image::imageops::FilterType::Triangle);
    let img = img.to_rgb8();
    let data = img.into_raw();
    let size = IMAGE_SIZE as usize;
    let data = Tensor::from_vec(data, (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&[0.48145466f32, 0.4578275, 0.40821073], &Device::Cpu)?
        .reshape((3, 1, 1))?;
    let std = Tensor::new(&[0.26862954f32, 0.261_302_6, 0.275_777_1], &Device::Cpu)?
        .reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_selects_configuration() {
        assert_eq!(
            BLIPModel::from_identifier("Salesforce/blip-image-captioning-large"),
            Some(BLIPModel::Large)
        );
        assert_eq!(
            BLIPModel::from_identifier("Salesforce/BLIP-image-captioning-base"),
            Some(BLIPModel::Base)
        );
        assert_eq!(BLIPModel::from_identifier("Xenova/vit-gpt2-image-captioning"), None);
    }

    #[test]
    fn image_tensor_has_expected_shape() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(10, 20, image::Rgb([255, 0, 0])));
        let tensor = load_image(&image).expect("tensor");
        assert_eq!(tensor.dims(), &[3, 384, 384]);
    }

    #[test]
    fn missing_artifacts_fail_to_load() {
        let dir = std::env::temp_dir().join("blip-missing-artifacts");
        let result = BLIP::new(dir.join(MODEL_FILE), dir.join(TOKENIZER_FILE), BLIPModel::Base);
        assert!(result.is_err());
    }
}

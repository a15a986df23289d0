use crate::config::Config;
use ai::{
    blip::{self, BLIPModel, BLIP},
    AIModel, ImageCaptionModel, ModelLoader,
};
use anyhow::{anyhow, Context};
use file_downloader::{FileDownload, FileDownloadConfig};
use std::sync::Arc;

/// Loader for the captioning backend configured in `config`. Nothing is
/// downloaded or instantiated until the first acquire.
pub fn caption_model_loader(config: &Config) -> anyhow::Result<ModelLoader<ImageCaptionModel>> {
    let download = Arc::new(FileDownload::new(FileDownloadConfig {
        url: config.artifacts.endpoint.clone(),
        resources_dir: config.artifacts.cache_dir.clone(),
        token: config.artifacts.token.clone(),
        allow_remote: config.artifacts.allow_remote,
        ..Default::default()
    })?);

    Ok(ModelLoader::new(
        &config.model.primary,
        &config.model.fallback,
        move |identifier| {
            let download = download.clone();
            async move { create_image_caption(identifier, &download).await }
        },
    ))
}

pub async fn create_image_caption(
    identifier: String,
    download: &FileDownload,
) -> anyhow::Result<ImageCaptionModel> {
    let model_type = BLIPModel::from_identifier(&identifier)
        .ok_or_else(|| anyhow!("unsupported model {} for image caption", identifier))?;

    let model_path = download
        .download_if_not_exists(&identifier, blip::MODEL_FILE)
        .await?;
    let tokenizer_path = download
        .download_if_not_exists(&identifier, blip::TOKENIZER_FILE)
        .await?;

    let model = tokio::task::spawn_blocking(move || BLIP::new(model_path, tokenizer_path, model_type))
        .await
        .context("model construction was interrupted")??;

    AIModel::spawn(identifier, model)
}

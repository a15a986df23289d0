pub mod ai;
pub mod caption;
pub mod config;
pub mod error;
pub mod image_source;
pub mod routes;
pub mod standalone;

use ::ai::{ImageCaptionModel, ModelLoader};
use caption::CaptionService;
use config::Config;
use image_metrics::MetricsConfig;
use image_source::ImageSource;
use std::sync::Arc;

/// Shared by every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub loader: ModelLoader<ImageCaptionModel>,
    pub captioner: CaptionService,
}

impl AppState {
    pub fn new(config: Config, loader: ModelLoader<ImageCaptionModel>) -> anyhow::Result<Self> {
        let source = ImageSource::new(config.fetch_timeout, config.max_image_bytes)?;
        let metrics = config.enable_metrics.then_some(MetricsConfig {
            edge_detection: config.enable_edge_detection,
        });
        let captioner =
            CaptionService::new(loader.clone(), source, metrics, config.inference_timeout);

        Ok(Self {
            config: Arc::new(config),
            loader,
            captioner,
        })
    }
}

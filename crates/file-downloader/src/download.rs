use anyhow::{bail, Context};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::info;

pub struct FileDownloadConfig {
    /// Artifact host, files are fetched from `{url}/{repo}/resolve/{revision}/{file}`
    pub url: String,
    pub revision: String,
    pub resources_dir: PathBuf,
    /// Bearer credential for gated repositories
    pub token: Option<String>,
    /// When false only files already in `resources_dir` are served
    pub allow_remote: bool,
}

pub struct FileDownload {
    url: String,
    revision: String,
    resources_dir: PathBuf,
    allow_remote: bool,
    client: reqwest::Client,
}

impl Default for FileDownloadConfig {
    fn default() -> Self {
        Self {
            url: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            resources_dir: PathBuf::from("resources"),
            token: None,
            allow_remote: true,
        }
    }
}

impl FileDownload {
    pub fn new(config: FileDownloadConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("file-downloader/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("invalid token for artifact host")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            revision: config.revision,
            resources_dir: config.resources_dir,
            allow_remote: config.allow_remote,
            client,
        })
    }

    pub fn remote_url(&self, repo: &str, file_name: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.url,
            repo.trim_matches('/'),
            self.revision,
            file_name
        )
    }

    pub async fn download_to_path_if_not_exists(
        &self,
        download_url: &str,
        file_path: impl AsRef<Path>,
    ) -> anyhow::Result<PathBuf> {
        let file_path = file_path.as_ref().to_path_buf();
        info!("check file path: {:?}", file_path);
        if file_path.exists() {
            return Ok(file_path);
        }

        if !self.allow_remote {
            bail!(
                "{} is not cached and remote downloads are disabled",
                file_path.display()
            );
        }

        let temp_download_path = file_path.with_extension("temp");

        let mut response = self
            .client
            .get(download_url)
            .send()
            .await
            .with_context(|| format!("failed to request {}", download_url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("failed to download {}: {}", download_url, status);
        }

        // create parent folder
        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir).await?;
        }

        let mut file = File::create(&temp_download_path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        fs::rename(&temp_download_path, &file_path).await?;

        info!("file {:?} downloaded", file_path);

        Ok(file_path)
    }

    /// Resolve `{resources_dir}/{repo}/{file_name}`, downloading it first if missing.
    pub async fn download_if_not_exists(
        &self,
        repo: &str,
        file_name: &str,
    ) -> anyhow::Result<PathBuf> {
        let file_path = self.resources_dir.join(repo).join(file_name);
        let download_url = self.remote_url(repo, file_name);
        self.download_to_path_if_not_exists(&download_url, file_path)
            .await
    }
}

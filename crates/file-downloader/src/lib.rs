mod download;
pub use download::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("file-downloader-tests")
            .join(format!("{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn remote_url_follows_resolve_layout() {
        let download = FileDownload::new(FileDownloadConfig {
            url: "https://huggingface.co/".into(),
            ..Default::default()
        })
        .expect("client");

        assert_eq!(
            download.remote_url("Salesforce/blip-image-captioning-base", "tokenizer.json"),
            "https://huggingface.co/Salesforce/blip-image-captioning-base/resolve/main/tokenizer.json"
        );
    }

    #[test_log::test(tokio::test)]
    async fn cached_file_is_served_without_network() {
        let dir = scratch_dir("cached");
        let cached = dir.join("org/model").join("tokenizer.json");
        std::fs::create_dir_all(cached.parent().expect("parent")).expect("mkdir");
        std::fs::write(&cached, b"{}").expect("write");

        let download = FileDownload::new(FileDownloadConfig {
            // unroutable, the cache hit must not touch it
            url: "http://127.0.0.1:1".into(),
            resources_dir: dir.clone(),
            allow_remote: false,
            ..Default::default()
        })
        .expect("client");

        let path = download
            .download_if_not_exists("org/model", "tokenizer.json")
            .await
            .expect("cache hit");
        assert_eq!(path, cached);
    }

    #[test_log::test(tokio::test)]
    async fn missing_file_fails_when_remote_is_disabled() {
        let dir = scratch_dir("offline");
        let download = FileDownload::new(FileDownloadConfig {
            resources_dir: dir,
            allow_remote: false,
            ..Default::default()
        })
        .expect("client");

        let err = download
            .download_if_not_exists("org/model", "model.safetensors")
            .await
            .expect_err("not cached");
        assert!(err.to_string().contains("remote downloads are disabled"));
    }

    #[test_log::test(tokio::test)]
    async fn unreachable_host_is_an_error() {
        let dir = scratch_dir("unreachable");
        let download = FileDownload::new(FileDownloadConfig {
            url: "http://127.0.0.1:1".into(),
            resources_dir: dir.clone(),
            token: Some("secret".into()),
            ..Default::default()
        })
        .expect("client");

        assert!(download
            .download_if_not_exists("org/model", "model.safetensors")
            .await
            .is_err());
        assert!(!dir.join("org/model/model.safetensors").exists());
    }
}

//! Turns the image reference of a caption request into a decoded image.
//!
//! A reference is either an `http(s)` URL, a `data:` URI or a bare base64
//! payload. Fetching goes through a shared reqwest client bounded by a timeout
//! and a byte budget; decoding runs on a blocking thread.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use image::{DynamicImage, ImageFormat};
use reqwest::{header, StatusCode, Url};
use std::{sync::Arc, time::Duration};
use tracing::debug;

const USER_AGENT: &str = concat!("caption-server/", env!("CARGO_PKG_VERSION"));

const BASE64_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const BASE64_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum ImageSourceError {
    #[error("image_url or image_base64 is required")]
    Missing,
    #[error("image_url must be an http(s) URL or a data URI, got {0:?}")]
    UnsupportedUrl(String),
    #[error("failed to fetch image: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to fetch image: HTTP {0}")]
    Status(StatusCode),
    #[error("fetching image timed out after {0:?}")]
    Timeout(Duration),
    #[error("image exceeds the {0} byte limit")]
    TooLarge(usize),
    #[error("malformed data URI, expected data:<media type>;base64,<payload>")]
    MalformedDataUri,
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image payload is empty")]
    Empty,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image decoding was interrupted: {0}")]
    Interrupted(String),
}

impl ImageSourceError {
    /// Errors caused by the request shape itself, as opposed to the content
    /// or reachability of the referenced image.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::Missing | Self::UnsupportedUrl(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    Url(Url),
    DataUri { media_type: String, payload: String },
    Base64(String),
}

impl ImageReference {
    /// `image_url` takes precedence over `image_base64`, empty strings count
    /// as absent.
    pub fn from_request(
        image_url: Option<&str>,
        image_base64: Option<&str>,
    ) -> Result<Self, ImageSourceError> {
        let image_url = image_url.map(str::trim).filter(|s| !s.is_empty());
        let image_base64 = image_base64.map(str::trim).filter(|s| !s.is_empty());

        match (image_url, image_base64) {
            (Some(url), _) => {
                if is_data_uri(url) {
                    return parse_data_uri(url);
                }
                match Url::parse(url) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                        Ok(Self::Url(parsed))
                    }
                    _ => Err(ImageSourceError::UnsupportedUrl(url.to_string())),
                }
            }
            (None, Some(payload)) => {
                if is_data_uri(payload) {
                    parse_data_uri(payload)
                } else if is_http_url(payload) {
                    Url::parse(payload)
                        .map(Self::Url)
                        .map_err(|_| ImageSourceError::UnsupportedUrl(payload.to_string()))
                } else {
                    Ok(Self::Base64(payload.to_string()))
                }
            }
            (None, None) => Err(ImageSourceError::Missing),
        }
    }
}

fn has_prefix_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn is_data_uri(s: &str) -> bool {
    has_prefix_ignore_case(s, "data:")
}

fn is_http_url(s: &str) -> bool {
    has_prefix_ignore_case(s, "http://") || has_prefix_ignore_case(s, "https://")
}

fn parse_data_uri(uri: &str) -> Result<ImageReference, ImageSourceError> {
    let (header, payload) = uri["data:".len()..]
        .split_once(',')
        .ok_or(ImageSourceError::MalformedDataUri)?;

    let media_type = match header.rsplit_once(';') {
        Some((media_type, encoding)) if encoding.eq_ignore_ascii_case("base64") => media_type,
        _ => return Err(ImageSourceError::MalformedDataUri),
    };

    Ok(ImageReference::DataUri {
        media_type: media_type.trim().to_ascii_lowercase(),
        payload: payload.to_string(),
    })
}

/// Standard alphabet first, URL-safe as a second chance. Padding is optional
/// and embedded whitespace is ignored.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, ImageSourceError> {
    let compact: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(ImageSourceError::Empty);
    }

    match BASE64_STANDARD.decode(&compact) {
        Ok(bytes) => Ok(bytes),
        Err(e) if compact.contains(['-', '_']) => {
            BASE64_URL_SAFE.decode(&compact).map_err(|_| e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Raw image bytes plus whatever the source claimed about their format.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format_hint: Option<ImageFormat>,
}

impl EncodedImage {
    /// Sniff the format from magic bytes, then the declared type, and finally
    /// assume JPEG.
    pub fn decode(&self) -> Result<DynamicImage, ImageSourceError> {
        if self.bytes.is_empty() {
            return Err(ImageSourceError::Empty);
        }
        let format = image::guess_format(&self.bytes)
            .ok()
            .or(self.format_hint)
            .unwrap_or(ImageFormat::Jpeg);
        Ok(image::load_from_memory_with_format(&self.bytes, format)?)
    }
}

/// Decode on a blocking thread so large images do not stall the runtime.
pub async fn decode_in_background(
    encoded: EncodedImage,
) -> Result<Arc<DynamicImage>, ImageSourceError> {
    tokio::task::spawn_blocking(move || encoded.decode().map(Arc::new))
        .await
        .map_err(|e| ImageSourceError::Interrupted(e.to_string()))?
}

#[derive(Debug, Clone)]
pub struct ImageSource {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl ImageSource {
    pub fn new(timeout: Duration, max_bytes: usize) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));

        // no client-level timeout, `fetch` bounds the whole exchange
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    pub async fn fetch(&self, reference: &ImageReference) -> Result<EncodedImage, ImageSourceError> {
        let encoded = match reference {
            ImageReference::Url(url) => {
                tokio::time::timeout(self.timeout, self.fetch_url(url))
                    .await
                    .map_err(|_| ImageSourceError::Timeout(self.timeout))??
            }
            ImageReference::DataUri {
                media_type,
                payload,
            } => EncodedImage {
                bytes: decode_base64(payload)?,
                format_hint: ImageFormat::from_mime_type(media_type),
            },
            ImageReference::Base64(payload) => EncodedImage {
                bytes: decode_base64(payload)?,
                format_hint: None,
            },
        };

        if encoded.bytes.len() > self.max_bytes {
            return Err(ImageSourceError::TooLarge(self.max_bytes));
        }
        Ok(encoded)
    }

    /// Connect, headers and body all count against the fetch timeout.
    async fn fetch_url(&self, url: &Url) -> Result<EncodedImage, ImageSourceError> {
        debug!("fetching image from {}", url);
        let mut response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageSourceError::Status(status));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(ImageSourceError::TooLarge(self.max_bytes));
            }
        }

        let format_hint = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .and_then(|mime| ImageFormat::from_mime_type(mime.trim()));

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(ImageSourceError::TooLarge(self.max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!("fetched {} bytes from {}", bytes.len(), url);
        Ok(EncodedImage { bytes, format_hint })
    }
}

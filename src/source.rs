//! Stream Source Provider: resolves a video reference into stream descriptors
//! (via yt-dlp) and opens a byte stream for one of them (via reqwest).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::InfoCache;
use crate::config::Settings;
use crate::request::VideoReference;
use crate::ytdlp::{self, ExtractFailure};

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Extraction(#[from] ExtractFailure),
    #[error("extraction timed out after {0}s")]
    ExtractionTimeout(u64),
    #[error("extraction task failed: {0}")]
    Join(String),
    #[error("malformed extraction result: {0}")]
    Malformed(String),
    #[error("stream {0} is not available for this video")]
    StreamNotFound(String),
    #[error("stream request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("stream host returned HTTP {0}")]
    Status(u16),
    #[error("stream interrupted: {0}")]
    Interrupted(io::Error),
}

impl SourceError {
    pub fn public_message(&self) -> &'static str {
        match self {
            SourceError::Extraction(ExtractFailure::NotFound(_)) => {
                "Video not found. Please check the URL and make sure the video exists."
            }
            SourceError::Extraction(ExtractFailure::AuthRequired(_)) => {
                "This video requires login/authentication"
            }
            SourceError::Extraction(ExtractFailure::Forbidden(_)) => {
                "YouTube refused the request, try again later"
            }
            SourceError::Extraction(_) | SourceError::Malformed(_) | SourceError::Join(_) => {
                "Failed to extract video information"
            }
            SourceError::ExtractionTimeout(_) => "Extraction took too long",
            SourceError::StreamNotFound(_) => "The requested stream is no longer available",
            SourceError::Fetch(_) | SourceError::Status(_) | SourceError::Interrupted(_) => {
                "Failed to fetch media from YouTube"
            }
        }
    }
}

/// One encoded rendition of a video.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    pub identifier: String,
    pub container: String,
    pub quality_label: String,
    pub has_video: bool,
    pub has_embedded_audio: bool,
    /// kbps; audio bitrate for audio-only streams, total bitrate otherwise.
    pub bitrate: Option<f64>,
    pub height: Option<u32>,
}

impl StreamDescriptor {
    pub fn is_audio_only(&self) -> bool {
        self.has_embedded_audio && !self.has_video
    }
}

#[derive(Clone, Debug)]
pub struct RemoteFormat {
    pub descriptor: StreamDescriptor,
    pub url: String,
    pub protocol: String,
    pub http_headers: Vec<(String, String)>,
    /// yt-dlp's size, exact or estimated. Only for logs; never a Content-Length.
    pub size_hint: Option<u64>,
}

impl RemoteFormat {
    /// Manifest protocols cannot be fetched as a single body.
    pub fn is_direct(&self) -> bool {
        !self.url.is_empty() && matches!(self.protocol.as_str(), "" | "https" | "http")
    }
}

#[derive(Clone, Debug)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub formats: Vec<RemoteFormat>,
    /// Served from the redis cache rather than a fresh extraction.
    pub from_cache: bool,
}

impl VideoInfo {
    pub fn find(&self, stream_id: &str) -> Option<&RemoteFormat> {
        self.formats
            .iter()
            .find(|f| f.descriptor.identifier == stream_id)
    }
}

pub struct SourceStream {
    pub descriptor: StreamDescriptor,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn probe(&self, reference: &VideoReference) -> Result<VideoInfo, SourceError>;

    /// Open one stream of an already probed video.
    async fn open(&self, info: &VideoInfo, stream_id: &str) -> Result<SourceStream, SourceError>;
}

/// yt-dlp for extraction, reqwest for the stream bodies.
pub struct YtDlpSource {
    http: reqwest::Client,
    cache: Option<InfoCache>,
    cookies_path: Option<PathBuf>,
    headers: Arc<Vec<(String, String)>>,
    extraction_timeout: u64,
}

impl YtDlpSource {
    pub fn new(settings: &Settings, http: reqwest::Client, cache: Option<InfoCache>) -> Self {
        Self {
            http,
            cache,
            cookies_path: settings.cookies_path.clone(),
            headers: Arc::new(settings.source_headers.clone()),
            extraction_timeout: settings.ytdlp_timeout,
        }
    }

    async fn extract(&self, reference: &VideoReference) -> Result<(String, bool), SourceError> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(reference.id()).await {
                return Ok((cached, true));
            }
        }

        let url = reference.canonical_url();
        let cookies = self.cookies_path.clone();
        let headers = Arc::clone(&self.headers);
        let timeout_secs = self.extraction_timeout;

        info!("Extracting {url}");
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::task::spawn_blocking(move || {
                ytdlp::extract_with_ytdlp(
                    &url,
                    cookies.as_deref(),
                    &headers,
                    ytdlp::socket_timeout_for(timeout_secs),
                )
            }),
        )
        .await;

        let json = match result {
            Ok(Ok(Ok(json))) => json,
            Ok(Ok(Err(e))) => {
                error!("yt-dlp error for {}: {e}", reference.id());
                return Err(e.into());
            }
            Ok(Err(e)) => return Err(SourceError::Join(e.to_string())),
            Err(_) => return Err(SourceError::ExtractionTimeout(timeout_secs)),
        };

        if let Some(cache) = &self.cache {
            cache.put(reference.id(), &json).await;
        }
        Ok((json, false))
    }
}

#[async_trait]
impl StreamSource for YtDlpSource {
    async fn probe(&self, reference: &VideoReference) -> Result<VideoInfo, SourceError> {
        let (json, cached) = self.extract(reference).await?;
        let value: Value =
            serde_json::from_str(&json).map_err(|e| SourceError::Malformed(e.to_string()))?;
        let mut info = parse_info(&value)?;
        info.from_cache = cached;
        Ok(info)
    }

    async fn open(&self, info: &VideoInfo, stream_id: &str) -> Result<SourceStream, SourceError> {
        let format = info
            .find(stream_id)
            .filter(|f| f.is_direct())
            .ok_or_else(|| SourceError::StreamNotFound(stream_id.to_string()))?;

        let mut request = self
            .http
            .get(&format.url)
            .header("Accept-Encoding", "identity");
        for (name, value) in format.http_headers.iter().chain(self.headers.iter()) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                request = request.header(name, value);
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            warn!(
                "Stream {stream_id} of {} returned status {}",
                info.id,
                response.status()
            );
            // Signed URLs expire; make the next request re-extract.
            if info.from_cache {
                if let Some(cache) = &self.cache {
                    cache.invalidate(&info.id).await;
                }
            }
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let content_length = response.content_length();
        debug!(
            "Opened stream {stream_id} of {} (length {content_length:?}, yt-dlp size {:?})",
            info.id, format.size_hint
        );

        Ok(SourceStream {
            descriptor: format.descriptor.clone(),
            content_length,
            body: response.bytes_stream().map_err(io::Error::other).boxed(),
        })
    }
}

/// Turn a yt-dlp info dict into a [`VideoInfo`].
pub fn parse_info(data: &Value) -> Result<VideoInfo, SourceError> {
    let id = data["id"]
        .as_str()
        .ok_or_else(|| SourceError::Malformed("missing id".into()))?
        .to_string();
    let formats = data["formats"]
        .as_array()
        .ok_or_else(|| SourceError::Malformed("missing formats".into()))?
        .iter()
        .filter_map(parse_format)
        .collect();

    Ok(VideoInfo {
        title: str_or(data, "title", str_or(data, "fulltitle", id.clone())),
        thumbnail: data["thumbnail"].as_str().map(str::to_string),
        id,
        formats,
        from_cache: false,
    })
}

fn parse_format(f: &Value) -> Option<RemoteFormat> {
    let identifier = f["format_id"].as_str()?.to_string();
    let has_video = codec_present(&f["vcodec"]);
    let has_embedded_audio = codec_present(&f["acodec"]);
    let height = f["height"].as_u64().and_then(|h| u32::try_from(h).ok());

    let quality_label = if has_video {
        match f["format_note"].as_str() {
            Some(note) if note.starts_with(|c: char| c.is_ascii_digit()) => note.to_string(),
            _ => height.map(|h| format!("{h}p")).unwrap_or_else(|| "unknown".into()),
        }
    } else {
        match f["abr"].as_f64() {
            Some(abr) => format!("{}kbps", abr.round() as u32),
            None => str_or(f, "format_note", "audio".into()),
        }
    };

    let bitrate = if has_video {
        f["tbr"].as_f64()
    } else {
        f["abr"].as_f64().or_else(|| f["tbr"].as_f64())
    };

    let http_headers = f["http_headers"]
        .as_object()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(RemoteFormat {
        descriptor: StreamDescriptor {
            identifier,
            container: str_or(f, "ext", "bin".into()),
            quality_label,
            has_video,
            has_embedded_audio,
            bitrate,
            height,
        },
        url: str_or(f, "url", String::new()),
        protocol: str_or(f, "protocol", String::new()),
        http_headers,
        size_hint: f["filesize"]
            .as_u64()
            .or_else(|| f["filesize_approx"].as_u64()),
    })
}

fn codec_present(v: &Value) -> bool {
    v.as_str().is_some_and(|c| !c.is_empty() && c != "none")
}

fn str_or(v: &Value, key: &str, default: String) -> String {
    v[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or(default)
}

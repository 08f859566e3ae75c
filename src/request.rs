use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;

use crate::error::AppError;

static YOUTUBE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.|m\.)?(?:youtube\.com/(?:watch\?(?:\S*&)?v=|embed/|v/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[?&#/]\S*)?$",
    )
    .expect("static regex")
});

static STREAM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,48}$").expect("static regex"));

/// A YouTube video reference that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoReference {
    id: String,
}

impl VideoReference {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidRequest("URL parameter is required".into()));
        }
        let caps = YOUTUBE_REF
            .captures(trimmed)
            .ok_or_else(|| AppError::InvalidRequest("Invalid YouTube URL".into()))?;
        Ok(Self {
            id: caps[1].to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn canonical_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.id)
    }
}

impl fmt::Display for VideoReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_url())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetFormat {
    Mp4,
    Mp3,
}

impl TargetFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(TargetFormat::Mp4),
            "mp3" => Some(TargetFormat::Mp3),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "mp4",
            TargetFormat::Mp3 => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "video/mp4",
            TargetFormat::Mp3 => "audio/mpeg",
        }
    }
}

/// Raw `/download` query. Every field is optional so that missing parameters
/// are reported with our own JSON error instead of the extractor's rejection.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub title: Option<String>,
    pub format: Option<String>,
    #[serde(rename = "videoItag")]
    pub video_itag: Option<String>,
    #[serde(rename = "audioItag")]
    pub audio_itag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    pub source: VideoReference,
    pub title: String,
    pub format: TargetFormat,
    pub primary_stream: String,
    pub secondary_audio_stream: Option<String>,
}

impl DownloadRequest {
    pub fn from_query(query: DownloadQuery) -> Result<Self, AppError> {
        let source = VideoReference::parse(query.url.as_deref().unwrap_or(""))?;

        let format = match query.format.as_deref() {
            None | Some("") => {
                return Err(AppError::InvalidRequest("format parameter is required".into()))
            }
            Some(raw) => TargetFormat::parse(raw).ok_or_else(|| {
                AppError::InvalidRequest(format!("Unsupported format '{raw}', expected mp4 or mp3"))
            })?,
        };

        let primary_stream = non_empty(query.video_itag)
            .ok_or_else(|| AppError::InvalidRequest("videoItag parameter is required".into()))?;
        check_stream_id("videoItag", &primary_stream)?;

        // The secondary audio stream only matters for the merge path.
        let secondary_audio_stream = match format {
            TargetFormat::Mp3 => None,
            TargetFormat::Mp4 => non_empty(query.audio_itag),
        };
        if let Some(audio) = &secondary_audio_stream {
            check_stream_id("audioItag", audio)?;
        }

        let title = non_empty(query.title).unwrap_or_else(|| source.id().to_string());

        Ok(Self {
            source,
            title,
            format,
            primary_stream,
            secondary_audio_stream,
        })
    }

    /// `<sanitised title>.<ext>`
    pub fn filename(&self) -> String {
        format!("{}.{}", sanitize_title(&self.title), self.format.extension())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_stream_id(param: &str, value: &str) -> Result<(), AppError> {
    if STREAM_ID.is_match(value) {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(format!("Invalid {param} value")))
    }
}

/// Keep `[A-Za-z0-9 _.-]`, fold whitespace runs into `_`, and never return an
/// empty stem.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-'))
        .collect();
    let joined = kept.split_whitespace().collect::<Vec<_>>().join("_");
    let trimmed = joined.trim_matches(|c: char| matches!(c, '.' | '_' | '-'));

    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

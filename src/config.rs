use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::warn;

/// How transcoded/remuxed output reaches the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Pipe the media tool's stdout straight into the response body.
    Streaming,
    /// Write the output to the request workspace, then serve the finished file.
    DiskBuffered,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Streaming => "streaming",
            DeliveryMode::DiskBuffered => "disk",
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" | "direct" => Ok(DeliveryMode::Streaming),
            "disk" | "buffered" | "file" => Ok(DeliveryMode::DiskBuffered),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub port: u16,
    /// `*` allows any origin.
    pub cors_origin: String,
    pub temp_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub delivery_mode: DeliveryMode,
    pub cookies_path: Option<PathBuf>,
    /// Extra headers forwarded to yt-dlp and to every stream fetch.
    pub source_headers: Vec<(String, String)>,
    pub ytdlp_timeout: u64,
    pub download_timeout: u64,
    pub redis_host: Option<String>,
    pub redis_port: u16,
    pub cache_ttl: u64,
    pub stale_artifact_age: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 5000),
            cors_origin: env_str("CORS_ORIGIN", "*"),
            temp_dir: PathBuf::from(env_str("TEMP_DIR", "./temp")),
            ffmpeg_path: PathBuf::from(env_str("FFMPEG_PATH", "ffmpeg")),
            delivery_mode: env_parse("DELIVERY_MODE", DeliveryMode::Streaming),
            cookies_path: env_opt("COOKIES_PATH").map(PathBuf::from),
            source_headers: env_opt("SOURCE_HEADERS")
                .map(|blob| match decode_header_blob(&blob) {
                    Ok(headers) => headers,
                    Err(e) => {
                        warn!("Ignoring SOURCE_HEADERS: {e}");
                        Vec::new()
                    }
                })
                .unwrap_or_default(),
            ytdlp_timeout: env_parse("YTDLP_TIMEOUT", 30),
            download_timeout: env_parse("DOWNLOAD_TIMEOUT", 900),
            redis_host: env_opt("REDIS_HOST"),
            redis_port: env_parse("REDIS_PORT", 6379),
            cache_ttl: env_parse("CACHE_TTL", 300),
            stale_artifact_age: env_parse("STALE_ARTIFACT_AGE", 3600),
        }
    }

    pub fn download_deadline(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 5000,
            cors_origin: "*".to_string(),
            temp_dir: PathBuf::from("./temp"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            delivery_mode: DeliveryMode::Streaming,
            cookies_path: None,
            source_headers: Vec::new(),
            ytdlp_timeout: 30,
            download_timeout: 900,
            redis_host: None,
            redis_port: 6379,
            cache_ttl: 300,
            stale_artifact_age: 3600,
        }
    }
}

/// Decode a base64 JSON object (`{"Cookie": "...", "User-Agent": "..."}`) into
/// header pairs. Non-string values are rejected.
pub fn decode_header_blob(blob: &str) -> Result<Vec<(String, String)>, String> {
    let raw = STANDARD
        .decode(blob.trim().as_bytes())
        .map_err(|e| format!("base64 decode failed: {e}"))?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| format!("invalid JSON: {e}"))?;
    let map = value
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_string())?;

    map.iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|s| (k.clone(), s.to_string()))
                .ok_or_else(|| format!("header {k} is not a string"))
        })
        .collect()
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    parse_or_default(key, env::var(key).ok(), default)
}

/// Unset keeps the default silently; an unparsable value keeps it with a warning.
fn parse_or_default<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = raw.filter(|v| !v.trim().is_empty()) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring {key}={raw:?}: {e}");
            default
        }
    }
}

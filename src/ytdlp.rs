use std::path::Path;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use thiserror::Error;

/// Why yt-dlp could not resolve a reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractFailure {
    #[error("video not found: {0}")]
    NotFound(String),
    #[error("access forbidden: {0}")]
    Forbidden(String),
    #[error("login required: {0}")]
    AuthRequired(String),
    #[error("unsupported url: {0}")]
    Unsupported(String),
    #[error("extraction failed: {0}")]
    Failed(String),
}

impl ExtractFailure {
    /// Bucket a yt-dlp error message.
    pub fn classify(message: String) -> Self {
        let lower = message.to_lowercase();
        // "Unable to download webpage: HTTP Error 403" is a refusal, not a missing video.
        if message.contains("403") || lower.contains("forbidden") {
            ExtractFailure::Forbidden(message)
        } else if lower.contains("not found")
            || lower.contains("unable to download")
            || lower.contains("video unavailable")
        {
            ExtractFailure::NotFound(message)
        } else if lower.contains("sign in") || lower.contains("login") || lower.contains("authentication") {
            ExtractFailure::AuthRequired(message)
        } else if lower.contains("unsupported url") {
            ExtractFailure::Unsupported(message)
        } else {
            ExtractFailure::Failed(message)
        }
    }
}

/// Per-socket timeout handed to yt-dlp for an extraction budget of
/// `extraction_secs`. Python cannot be interrupted from here, so an abandoned
/// extraction only stops once its sockets give up.
pub fn socket_timeout_for(extraction_secs: u64) -> u64 {
    (extraction_secs / 3).clamp(1, 30)
}

/// Call `yt_dlp.YoutubeDL.extract_info()` and return the info dict as JSON.
/// Blocking: run it on the blocking pool.
pub fn extract_with_ytdlp(
    url: &str,
    cookies_path: Option<&Path>,
    headers: &[(String, String)],
    socket_timeout: u64,
) -> Result<String, ExtractFailure> {
    Python::with_gil(|py| {
        let yt_dlp = py
            .import("yt_dlp")
            .map_err(|e| ExtractFailure::Failed(format!("Failed to import yt_dlp: {e}")))?;

        let opts = build_options(py, cookies_path, headers, socket_timeout)
            .map_err(|e| ExtractFailure::Failed(format!("Failed to build options: {e}")))?;

        let ydl = yt_dlp
            .getattr("YoutubeDL")
            .and_then(|class| class.call1((opts,)))
            .map_err(|e| ExtractFailure::Failed(format!("Failed to create YoutubeDL: {e}")))?;

        let kwargs = PyDict::new(py);
        kwargs
            .set_item("download", false)
            .map_err(|e| ExtractFailure::Failed(e.to_string()))?;
        let info = ydl.call_method("extract_info", (url,), Some(&kwargs));

        // Close before inspecting the result to release file descriptors.
        let _ = ydl.call_method0("close");
        let info = info.map_err(|e| ExtractFailure::classify(e.to_string()))?;
        // Drops values json.dumps cannot encode.
        let info = ydl
            .call_method1("sanitize_info", (info.clone(),))
            .unwrap_or(info);

        let json_mod = py
            .import("json")
            .map_err(|e| ExtractFailure::Failed(format!("Failed to import json: {e}")))?;
        json_mod
            .call_method1("dumps", (info,))
            .and_then(|dumped| dumped.extract::<String>())
            .map_err(|e| ExtractFailure::Failed(format!("Failed to serialize: {e}")))
    })
}

fn build_options<'py>(
    py: Python<'py>,
    cookies_path: Option<&Path>,
    headers: &[(String, String)],
    socket_timeout: u64,
) -> PyResult<Bound<'py, PyDict>> {
    let opts = PyDict::new(py);
    opts.set_item("quiet", true)?;
    opts.set_item("no_warnings", true)?;
    opts.set_item("noplaylist", true)?;
    opts.set_item("extract_flat", false)?;
    opts.set_item("socket_timeout", socket_timeout)?;

    if let Some(path) = cookies_path.filter(|p| p.exists()) {
        opts.set_item("cookiefile", path.to_string_lossy().as_ref())?;
    }

    if !headers.is_empty() {
        let http_headers = PyDict::new(py);
        for (name, value) in headers {
            http_headers.set_item(name.as_str(), value.as_str())?;
        }
        opts.set_item("http_headers", http_headers)?;
    }

    Ok(opts)
}

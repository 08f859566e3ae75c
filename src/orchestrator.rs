//! Download Orchestrator: turns a validated request into exactly one response.
//!
//! Everything that can fail before the first byte (fetching, materialising,
//! spawning) fails with an `AppError` and a JSON body. Once the response is
//! built, later failures abort the body instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::artifact::Workspace;
use crate::config::DeliveryMode;
use crate::delivery::{write_stream_to_file, Delivered, DeliveryStrategy, JobContext};
use crate::error::AppError;
use crate::media::{MediaJob, NamedInput, Operation};
use crate::request::{DownloadRequest, TargetFormat, VideoReference};
use crate::source::{StreamSource, VideoInfo};

pub const MP3_BITRATE_KBPS: u32 = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    TranscodeMp3 { audio: String },
    Merge { video: String, audio: String },
    Passthrough { stream: String },
}

impl Plan {
    pub fn select(request: &DownloadRequest) -> Plan {
        match (request.format, &request.secondary_audio_stream) {
            (TargetFormat::Mp3, _) => Plan::TranscodeMp3 {
                audio: request.primary_stream.clone(),
            },
            (TargetFormat::Mp4, Some(audio)) => Plan::Merge {
                video: request.primary_stream.clone(),
                audio: audio.clone(),
            },
            (TargetFormat::Mp4, None) => Plan::Passthrough {
                stream: request.primary_stream.clone(),
            },
        }
    }
}

pub struct Orchestrator {
    source: Arc<dyn StreamSource>,
    delivery: Arc<dyn DeliveryStrategy>,
    temp_dir: PathBuf,
    download_timeout: Duration,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn StreamSource>,
        delivery: Arc<dyn DeliveryStrategy>,
        temp_dir: PathBuf,
        download_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            delivery,
            temp_dir,
            download_timeout,
            shutdown,
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery.mode()
    }

    pub async fn download(&self, request: DownloadRequest) -> Result<Response<Body>, AppError> {
        let plan = Plan::select(&request);
        let filename = request.filename();
        let cancel = self.shutdown.child_token();
        let deadline = Instant::now() + self.download_timeout;

        info!(
            "Download {} as {filename} via {plan:?} ({})",
            request.source.id(),
            self.delivery.mode().as_str()
        );

        let delivered = match tokio::time::timeout_at(
            deadline,
            self.execute(&request.source, plan, cancel, deadline),
        )
        .await
        {
            Ok(Ok(delivered)) => delivered,
            Ok(Err(e)) => {
                error!("Download {} failed before responding: {e}", request.source.id());
                return Err(e);
            }
            Err(_) => {
                error!("Download {} hit its deadline before responding", request.source.id());
                return Err(AppError::TimedOut);
            }
        };

        Ok(build_response(request.format, &filename, delivered))
    }

    async fn execute(
        &self,
        reference: &VideoReference,
        plan: Plan,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Result<Delivered, AppError> {
        // One extraction per request; every stream is opened from it.
        let info = self.source.probe(reference).await?;

        match plan {
            Plan::Passthrough { stream } => {
                let source = self.source.open(&info, &stream).await?;
                let ctx = JobContext {
                    workspace: None,
                    cancel,
                    deadline,
                };
                self.delivery.passthrough(ctx, source).await
            }
            Plan::TranscodeMp3 { audio } => {
                let source = self.source.open(&info, &audio).await?;
                let job = MediaJob {
                    inputs: vec![NamedInput::pipe("audio", source.body)],
                    operation: Operation::TranscodeMp3 {
                        bitrate_kbps: MP3_BITRATE_KBPS,
                    },
                };
                let ctx = JobContext {
                    workspace: None,
                    cancel,
                    deadline,
                };
                self.delivery.process(ctx, job).await
            }
            Plan::Merge { video, audio } => {
                // Only one input can be piped, so both tracks land on disk first.
                let workspace = Workspace::create(&self.temp_dir)
                    .await
                    .map_err(|e| AppError::Internal(format!("Failed to create workspace: {e}")))?;
                debug!("Merging {} in {}", info.id, workspace.path().display());
                let video_path = workspace.file("video");
                let audio_path = workspace.file("audio");

                let (video_bytes, audio_bytes) = tokio::try_join!(
                    self.fetch_to_file(&info, &video, "video", &video_path, &cancel, deadline),
                    self.fetch_to_file(&info, &audio, "audio", &audio_path, &cancel, deadline),
                )?;
                info!(
                    "Fetched {} for merge: video {video_bytes} bytes, audio {audio_bytes} bytes",
                    info.id
                );

                let job = MediaJob {
                    inputs: vec![
                        NamedInput::file("video", video_path),
                        NamedInput::file("audio", audio_path),
                    ],
                    operation: Operation::Remux,
                };
                let ctx = JobContext {
                    workspace: Some(workspace),
                    cancel,
                    deadline,
                };
                self.delivery.process(ctx, job).await
            }
        }
    }

    async fn fetch_to_file(
        &self,
        info: &VideoInfo,
        stream_id: &str,
        name: &str,
        path: &Path,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<u64, AppError> {
        let source = self.source.open(info, stream_id).await?;
        write_stream_to_file(name, source.body, path, cancel, deadline).await
    }
}

fn build_response(format: TargetFormat, filename: &str, delivered: Delivered) -> Response<Body> {
    let mut response = Response::new(Body::from_stream(delivered.body));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    // Sanitised filenames are plain ASCII, so these always parse.
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(filename) {
        headers.insert("x-filename", value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Some(len) = delivered.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::strategy_for;
    use crate::media::MediaRunner;
    use crate::request::DownloadQuery;
    use crate::testing::{Chunk, FakeSource};
    use axum::body::to_bytes;

    const URL: &str = "https://www.youtube.com/watch?v=abc12345678";

    fn request(format: &str, video: &str, audio: Option<&str>) -> DownloadRequest {
        DownloadRequest::from_query(DownloadQuery {
            url: Some(URL.into()),
            title: Some("My Clip".into()),
            format: Some(format.into()),
            video_itag: Some(video.into()),
            audio_itag: audio.map(str::to_string),
        })
        .unwrap()
    }

    fn fake() -> FakeSource {
        FakeSource::new()
            .with_stream("18", true, true, vec![Chunk::Data("muxed-"), Chunk::Data("bytes")])
            .with_stream("136", true, false, vec![Chunk::Data("VIDEO")])
            .with_stream("140", false, true, vec![Chunk::Data("AUDIO")])
            .with_stream("bad", false, true, vec![Chunk::Data("AU"), Chunk::Fail])
            .with_stream("slow", false, true, vec![Chunk::Data("AU"), Chunk::Stall])
    }

    fn orchestrator(
        source: Arc<FakeSource>,
        mode: DeliveryMode,
        runner: MediaRunner,
        temp: &Path,
        timeout: Duration,
    ) -> Orchestrator {
        Orchestrator::new(
            source,
            strategy_for(mode, runner, temp.to_path_buf()),
            temp.to_path_buf(),
            timeout,
            CancellationToken::new(),
        )
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    // Concatenates the two input files into the job's output.
    const FAKE_REMUX_TO_FILE: &str = r#"for last; do :; done; cat "$6" "$8" > "$last""#;

    #[test]
    fn plan_follows_format_and_audio_stream() {
        assert_eq!(
            Plan::select(&request("mp3", "140", Some("251"))),
            Plan::TranscodeMp3 { audio: "140".into() }
        );
        assert_eq!(
            Plan::select(&request("mp4", "136", Some("140"))),
            Plan::Merge {
                video: "136".into(),
                audio: "140".into()
            }
        );
        assert_eq!(
            Plan::select(&request("mp4", "18", None)),
            Plan::Passthrough { stream: "18".into() }
        );
    }

    #[tokio::test]
    async fn passthrough_streams_source_bytes_with_headers() {
        let temp = tempfile::tempdir().unwrap();
        let source = Arc::new(fake());
        let orch = orchestrator(
            source.clone(),
            DeliveryMode::Streaming,
            MediaRunner::new("/nonexistent/ffmpeg"),
            temp.path(),
            Duration::from_secs(30),
        );

        let resp = orch.download(request("mp4", "18", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My_Clip.mp4\""
        );
        assert_eq!(resp.headers()["x-filename"], "My_Clip.mp4");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "11");

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"muxed-bytes");
        assert_eq!(source.probes(), 1);
        assert_eq!(source.opens(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mp3_pipes_audio_through_the_runner() {
        let temp = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(fake()),
            DeliveryMode::Streaming,
            MediaRunner::shell("cat"),
            temp.path(),
            Duration::from_secs(30),
        );

        let resp = orch.download(request("mp3", "140", None)).await.unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(resp.headers()["x-filename"], "My_Clip.mp3");
        assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"AUDIO");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merge_feeds_video_then_audio_and_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let source = Arc::new(fake());
        let orch = orchestrator(
            source.clone(),
            DeliveryMode::DiskBuffered,
            MediaRunner::shell(FAKE_REMUX_TO_FILE),
            temp.path(),
            Duration::from_secs(30),
        );

        let resp = orch.download(request("mp4", "136", Some("140"))).await.unwrap();
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(entries(temp.path()), 1);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"VIDEOAUDIO");
        assert_eq!(source.probes(), 1);
        assert_eq!(source.opens(), 2);
        assert_eq!(entries(temp.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streaming_merge_removes_inputs_once_the_body_ends() {
        let temp = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(fake()),
            DeliveryMode::Streaming,
            MediaRunner::shell(r#"cat "$6" "$8""#),
            temp.path(),
            Duration::from_secs(30),
        );

        let resp = orch.download(request("mp4", "136", Some("140"))).await.unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"VIDEOAUDIO");
        assert_eq!(entries(temp.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_abort_mid_merge_removes_the_workspace() {
        use futures_util::StreamExt;

        let temp = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(fake()),
            DeliveryMode::Streaming,
            MediaRunner::shell(r#"cat "$6"; exec sleep 30"#),
            temp.path(),
            Duration::from_secs(30),
        );

        let resp = orch.download(request("mp4", "136", Some("140"))).await.unwrap();
        let mut body = resp.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"VIDEO");
        assert_eq!(entries(temp.path()), 1);

        drop(body);
        assert_eq!(entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn failed_audio_fetch_skips_the_merge() {
        let temp = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(fake()),
            DeliveryMode::DiskBuffered,
            MediaRunner::new("/nonexistent/ffmpeg"),
            temp.path(),
            Duration::from_secs(30),
        );

        let err = orch
            .download(request("mp4", "136", Some("bad")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable(_)), "{err:?}");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn unknown_stream_fails_before_any_response() {
        let temp = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(fake()),
            DeliveryMode::Streaming,
            MediaRunner::new("/nonexistent/ffmpeg"),
            temp.path(),
            Duration::from_secs(30),
        );

        let err = orch.download(request("mp4", "999", None)).await.unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable(_)));
        assert_eq!(entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn stalled_merge_times_out_and_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(fake()),
            DeliveryMode::DiskBuffered,
            MediaRunner::new("/nonexistent/ffmpeg"),
            temp.path(),
            Duration::from_millis(100),
        );

        let err = orch
            .download(request("mp4", "136", Some("slow")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TimedOut));
        assert_eq!(entries(temp.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_merges_use_separate_workspaces() {
        let temp = tempfile::tempdir().unwrap();
        let orch = Arc::new(orchestrator(
            Arc::new(fake()),
            DeliveryMode::DiskBuffered,
            MediaRunner::shell(FAKE_REMUX_TO_FILE),
            temp.path(),
            Duration::from_secs(30),
        ));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let orch = orch.clone();
            tasks.push(tokio::spawn(async move {
                let resp = orch.download(request("mp4", "136", Some("140"))).await.unwrap();
                to_bytes(resp.into_body(), usize::MAX).await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(&task.await.unwrap()[..], b"VIDEOAUDIO");
        }
        assert_eq!(entries(temp.path()), 0);
    }
}

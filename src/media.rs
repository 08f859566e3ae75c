//! Media Process Runner: drives `ffmpeg` for one job.
//!
//! Inputs are named channels (a byte stream or a file on disk); the output is
//! either the process stdout as a byte stream or a file. The exit status is the
//! only success signal; stderr is kept as diagnostics.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::source::ByteStream;

/// Piped inputs the process can take: stdin only.
pub const PIPE_CHANNELS: usize = 1;

const DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("media tool exited with {code:?}: {diagnostics}")]
    Exit {
        code: Option<i32>,
        diagnostics: String,
    },
    #[error("input '{name}' failed: {source}")]
    Input {
        name: &'static str,
        source: io::Error,
    },
    #[error("job needs {requested} piped inputs but only {available} channel(s) exist")]
    ChannelsExhausted { requested: usize, available: usize },
    #[error("{operation} takes {expected} input(s), got {actual}")]
    InputCount {
        operation: Operation,
        expected: usize,
        actual: usize,
    },
    #[error("media job cancelled")]
    Cancelled,
    #[error("media job exceeded its deadline")]
    TimedOut,
    #[error("output was not created: {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Video track of input 0 + audio track of input 1, both copied, into MP4.
    Remux,
    /// Drop video, encode audio to MP3 at a constant bitrate.
    TranscodeMp3 { bitrate_kbps: u32 },
}

impl Operation {
    fn expected_inputs(self) -> usize {
        match self {
            Operation::Remux => 2,
            Operation::TranscodeMp3 { .. } => 1,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Remux => f.write_str("remux"),
            Operation::TranscodeMp3 { bitrate_kbps } => write!(f, "mp3@{bitrate_kbps}k"),
        }
    }
}

pub enum InputSource {
    Pipe(ByteStream),
    File(PathBuf),
}

pub struct NamedInput {
    pub name: &'static str,
    pub source: InputSource,
}

impl NamedInput {
    pub fn pipe(name: &'static str, stream: ByteStream) -> Self {
        Self {
            name,
            source: InputSource::Pipe(stream),
        }
    }

    pub fn file(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            source: InputSource::File(path.into()),
        }
    }

    fn is_pipe(&self) -> bool {
        matches!(self.source, InputSource::Pipe(_))
    }
}

pub struct MediaJob {
    pub inputs: Vec<NamedInput>,
    pub operation: Operation,
}

impl MediaJob {
    pub fn validate(&self) -> Result<(), MediaError> {
        let expected = self.operation.expected_inputs();
        if self.inputs.len() != expected {
            return Err(MediaError::InputCount {
                operation: self.operation,
                expected,
                actual: self.inputs.len(),
            });
        }
        let piped = self.inputs.iter().filter(|i| i.is_pipe()).count();
        if piped > PIPE_CHANNELS {
            return Err(MediaError::ChannelsExhausted {
                requested: piped,
                available: PIPE_CHANNELS,
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.inputs
            .iter()
            .map(|i| i.name)
            .collect::<Vec<_>>()
            .join("+")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputSink {
    Pipe,
    File(PathBuf),
}

pub enum MediaOutput {
    /// Process stdout. Ends with an error item if the process fails.
    Stream(ByteStream),
    File(PathBuf),
}

/// Command-line for a job. Pure, so it can be checked without spawning.
pub fn build_args(job: &MediaJob, sink: &OutputSink) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect();

    for input in &job.inputs {
        args.push("-i".into());
        match &input.source {
            InputSource::Pipe(_) => args.push("pipe:0".into()),
            InputSource::File(path) => args.push(path.as_os_str().to_owned()),
        }
    }

    let piped_output = matches!(sink, OutputSink::Pipe);
    let mut push = |items: &[&str]| args.extend(items.iter().map(OsString::from));

    match job.operation {
        Operation::Remux => push(&["-map", "0:v:0", "-map", "1:a:0", "-c", "copy"]),
        Operation::TranscodeMp3 { bitrate_kbps } => {
            let bitrate = format!("{bitrate_kbps}k");
            push(&["-vn", "-c:a", "libmp3lame", "-b:a", bitrate.as_str(), "-f", "mp3"]);
        }
    }

    if job.operation == Operation::Remux {
        // A pipe is not seekable, so the moov atom cannot be patched afterwards.
        let movflags = if piped_output {
            "frag_keyframe+empty_moov"
        } else {
            "+faststart"
        };
        push(&["-movflags", movflags, "-f", "mp4"]);
    }

    match sink {
        OutputSink::Pipe => args.push("pipe:1".into()),
        OutputSink::File(path) => args.push(path.as_os_str().to_owned()),
    }
    args
}

#[derive(Clone, Debug)]
pub struct MediaRunner {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl MediaRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Stand-in tool: `sh -c <script>`, job arguments become `$1..`.
    #[cfg(test)]
    pub(crate) fn shell(script: &str) -> Self {
        Self {
            program: PathBuf::from("sh"),
            leading_args: vec!["-c".into(), script.into(), "ffmpeg".into()],
        }
    }

    /// Run `job` writing to `sink`. A file sink is awaited to completion; a pipe
    /// sink returns as soon as the process is running.
    pub async fn run(
        &self,
        job: MediaJob,
        sink: OutputSink,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Result<MediaOutput, MediaError> {
        job.validate()?;
        let args = build_args(&job, &sink);
        let label = format!("{}[{}]", job.operation, job.describe());

        let piped_input = job.inputs.iter().any(NamedInput::is_pipe);
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(&args)
            .stdin(if piped_input { Stdio::piped() } else { Stdio::null() })
            .stdout(match sink {
                OutputSink::Pipe => Stdio::piped(),
                OutputSink::File(_) => Stdio::null(),
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| MediaError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        info!("Started {label} (pid {:?})", child.id());

        let halt = cancel.child_token();
        let diagnostics = tokio::spawn(collect_diagnostics(child.stderr.take(), label.clone()));

        let mut feeder = None;
        for input in job.inputs {
            if let InputSource::Pipe(stream) = input.source {
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other("stdin was not captured"))?;
                feeder = Some(tokio::spawn(feed_stdin(
                    input.name,
                    stream,
                    stdin,
                    halt.clone(),
                )));
            }
        }

        match sink {
            OutputSink::File(path) => {
                supervise(child, halt, deadline, feeder, diagnostics, label).await?;
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(MediaError::MissingOutput(path));
                }
                Ok(MediaOutput::File(path))
            }
            OutputSink::Pipe => {
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| io::Error::other("stdout was not captured"))?;
                let guard = halt.clone().drop_guard();
                let supervisor =
                    tokio::spawn(supervise(child, halt, deadline, feeder, diagnostics, label));

                let tail = futures_util::stream::once(async move {
                    match supervisor.await {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(Err(io::Error::other(e))),
                        Err(e) => Some(Err(io::Error::other(e))),
                    }
                })
                .filter_map(futures_util::future::ready);

                // Dropping the body (client gone) halts the process.
                let stream = ReaderStream::new(stdout).chain(tail).map(move |chunk| {
                    let _keep = &guard;
                    chunk
                });
                Ok(MediaOutput::Stream(stream.boxed()))
            }
        }
    }
}

/// Wait for the process, killing it on cancellation or deadline, then decide
/// the outcome. An input failure wins over everything else since it is what
/// caused the kill.
async fn supervise(
    mut child: Child,
    halt: CancellationToken,
    deadline: Instant,
    feeder: Option<JoinHandle<Result<(), MediaError>>>,
    diagnostics: JoinHandle<String>,
    label: String,
) -> Result<(), MediaError> {
    let outcome: Result<ExitStatus, MediaError> = tokio::select! {
        status = child.wait() => status.map_err(MediaError::from),
        _ = halt.cancelled() => Err(MediaError::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(MediaError::TimedOut),
    };
    if outcome.is_err() {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {label}: {e}");
        }
    }

    halt.cancel();
    let fed = match feeder {
        Some(handle) => handle
            .await
            .unwrap_or_else(|e| Err(MediaError::Io(io::Error::other(e)))),
        None => Ok(()),
    };
    // A killed process says nothing useful; do not wait on its stderr.
    let diagnostics = if outcome.is_ok() {
        diagnostics.await.unwrap_or_default()
    } else {
        diagnostics.abort();
        String::new()
    };

    let result = fed.and(outcome).and_then(|status| {
        if status.success() {
            Ok(())
        } else {
            Err(MediaError::Exit {
                code: status.code(),
                diagnostics,
            })
        }
    });

    match &result {
        Ok(()) => info!("Finished {label}"),
        Err(e) => error!("{label} failed: {e}"),
    }
    result
}

async fn feed_stdin(
    name: &'static str,
    mut stream: ByteStream,
    mut stdin: ChildStdin,
    halt: CancellationToken,
) -> Result<(), MediaError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = halt.cancelled() => return Ok(()),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                if let Err(e) = stdin.write_all(&chunk).await {
                    // The process decides success; a closed stdin is not a failure.
                    debug!("Stopped feeding '{name}': {e}");
                    return Ok(());
                }
            }
            Some(Err(source)) => {
                halt.cancel();
                return Err(MediaError::Input { name, source });
            }
            None => break,
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("Closing stdin for '{name}': {e}");
    }
    Ok(())
}

async fn collect_diagnostics(stderr: Option<ChildStderr>, label: String) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut tail = VecDeque::with_capacity(DIAGNOSTIC_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{label}: {line}");
        if tail.len() == DIAGNOSTIC_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use futures_util::TryStreamExt;
    use std::time::Duration;

    fn bytes_stream(chunks: &[&'static str]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        futures_util::stream::iter(items).boxed()
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn mp3_args_stream_through_stdio() {
        let job = MediaJob {
            inputs: vec![NamedInput::pipe("audio", bytes_stream(&[]))],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let args = strings(&build_args(&job, &OutputSink::Pipe));
        let joined = args.join(" ");
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-vn -c:a libmp3lame -b:a 128k -f mp3"));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn remux_args_map_video_then_audio() {
        let job = MediaJob {
            inputs: vec![
                NamedInput::file("video", "/w/video"),
                NamedInput::file("audio", "/w/audio"),
            ],
            operation: Operation::Remux,
        };
        let args = strings(&build_args(&job, &OutputSink::File("/w/out.mp4".into())));
        let joined = args.join(" ");
        assert!(joined.contains("-i /w/video -i /w/audio"));
        assert!(joined.contains("-map 0:v:0 -map 1:a:0 -c copy"));
        assert!(joined.contains("-movflags +faststart -f mp4"));
        assert!(!joined.contains("libmp3lame"));
        assert_eq!(args.last().unwrap(), "/w/out.mp4");

        let piped = strings(&build_args(&job, &OutputSink::Pipe)).join(" ");
        assert!(piped.contains("-movflags frag_keyframe+empty_moov"));
    }

    #[test]
    fn rejects_jobs_the_process_cannot_take() {
        let two_pipes = MediaJob {
            inputs: vec![
                NamedInput::pipe("video", bytes_stream(&[])),
                NamedInput::pipe("audio", bytes_stream(&[])),
            ],
            operation: Operation::Remux,
        };
        assert!(matches!(
            two_pipes.validate(),
            Err(MediaError::ChannelsExhausted { requested: 2, available: 1 })
        ));

        let short = MediaJob {
            inputs: vec![NamedInput::file("video", "/w/video")],
            operation: Operation::Remux,
        };
        assert!(matches!(
            short.validate(),
            Err(MediaError::InputCount { expected: 2, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = MediaRunner::new("/nonexistent/ffmpeg-binary");
        let job = MediaJob {
            inputs: vec![NamedInput::file("source", "/w/in")],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let result = runner
            .run(job, OutputSink::Pipe, CancellationToken::new(), later())
            .await;
        assert!(matches!(result, Err(MediaError::Spawn { .. })));
    }

    #[tokio::test]
    async fn non_zero_exit_is_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp3");
        // Writes the output and chatters on stderr, but still fails.
        let runner = MediaRunner::shell(r#"echo "boom" >&2; for last; do :; done; touch "$last"; exit 3"#);
        let job = MediaJob {
            inputs: vec![NamedInput::file("source", "/w/in")],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let result = runner
            .run(job, OutputSink::File(out), CancellationToken::new(), later())
            .await;
        match result {
            Err(MediaError::Exit { code, diagnostics }) => {
                assert_eq!(code, Some(3));
                assert_eq!(diagnostics, "boom");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn stderr_alone_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let runner = MediaRunner::shell(r#"echo "warning: odd timestamps" >&2; for last; do :; done; touch "$last""#);
        let job = MediaJob {
            inputs: vec![
                NamedInput::file("video", "/w/video"),
                NamedInput::file("audio", "/w/audio"),
            ],
            operation: Operation::Remux,
        };
        let output = runner
            .run(job, OutputSink::File(out.clone()), CancellationToken::new(), later())
            .await
            .unwrap();
        assert!(matches!(output, MediaOutput::File(p) if p == out));
    }

    #[tokio::test]
    async fn successful_exit_without_output_is_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MediaRunner::shell("exit 0");
        let job = MediaJob {
            inputs: vec![NamedInput::file("source", "/w/in")],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let result = runner
            .run(
                job,
                OutputSink::File(dir.path().join("never.mp3")),
                CancellationToken::new(),
                later(),
            )
            .await;
        assert!(matches!(result, Err(MediaError::MissingOutput(_))));
    }

    #[tokio::test]
    async fn piped_output_carries_process_stdout() {
        let runner = MediaRunner::shell("cat");
        let job = MediaJob {
            inputs: vec![NamedInput::pipe(
                "audio",
                bytes_stream(&["hello ", "world"]),
            )],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let MediaOutput::Stream(stream) = runner
            .run(job, OutputSink::Pipe, CancellationToken::new(), later())
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world");
    }

    #[tokio::test]
    async fn piped_output_ends_with_error_on_failure() {
        let runner = MediaRunner::shell("cat; exit 1");
        let job = MediaJob {
            inputs: vec![NamedInput::pipe("audio", bytes_stream(&["partial"]))],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let MediaOutput::Stream(stream) = runner
            .run(job, OutputSink::Pipe, CancellationToken::new(), later())
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };
        let items: Vec<io::Result<Bytes>> = stream.collect().await;
        assert_eq!(items.first().unwrap().as_ref().unwrap().as_ref(), b"partial");
        assert!(items.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn source_failure_while_feeding_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MediaRunner::shell("cat > /dev/null; exec sleep 30");
        let failing = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"head")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ])
        .chain(futures_util::stream::pending())
        .boxed();
        let job = MediaJob {
            inputs: vec![NamedInput::pipe("audio", failing)],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let started = std::time::Instant::now();
        let result = runner
            .run(
                job,
                OutputSink::File(dir.path().join("out.mp3")),
                CancellationToken::new(),
                later(),
            )
            .await;
        assert!(matches!(result, Err(MediaError::Input { name: "audio", .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn deadline_kills_a_hung_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MediaRunner::shell("exec sleep 30");
        let job = MediaJob {
            inputs: vec![NamedInput::pipe("audio", futures_util::stream::pending().boxed())],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let result = runner
            .run(
                job,
                OutputSink::File(dir.path().join("out.mp3")),
                CancellationToken::new(),
                Instant::now() + Duration::from_millis(200),
            )
            .await;
        assert!(matches!(result, Err(MediaError::TimedOut)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MediaRunner::shell("exec sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let job = MediaJob {
            inputs: vec![NamedInput::file("source", "/w/in")],
            operation: Operation::TranscodeMp3 { bitrate_kbps: 128 },
        };
        let result = runner
            .run(job, OutputSink::File(dir.path().join("out.mp3")), cancel, later())
            .await;
        assert!(matches!(result, Err(MediaError::Cancelled)));
    }
}

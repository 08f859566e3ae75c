//! How bytes reach the client: straight from a pipe, or through a finished
//! file in the request workspace. Selected once from `DELIVERY_MODE`.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, Sleep};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::Workspace;
use crate::config::DeliveryMode;
use crate::error::AppError;
use crate::media::{MediaJob, MediaOutput, MediaRunner, Operation, OutputSink};
use crate::source::{ByteStream, SourceError, SourceStream};

/// Per-request resources handed to a strategy.
pub struct JobContext {
    /// Files the job already depends on; kept alive until the body is done.
    pub workspace: Option<Workspace>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

pub struct Delivered {
    pub body: ByteStream,
    pub content_length: Option<u64>,
}

#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn mode(&self) -> DeliveryMode;

    /// Forward a complete stream's bytes unchanged.
    async fn passthrough(
        &self,
        ctx: JobContext,
        source: SourceStream,
    ) -> Result<Delivered, AppError>;

    /// Run a media job and deliver what it produces.
    async fn process(&self, ctx: JobContext, job: MediaJob) -> Result<Delivered, AppError>;
}

pub fn strategy_for(
    mode: DeliveryMode,
    runner: MediaRunner,
    temp_dir: PathBuf,
) -> Arc<dyn DeliveryStrategy> {
    match mode {
        DeliveryMode::Streaming => Arc::new(StreamingDelivery { runner }),
        DeliveryMode::DiskBuffered => Arc::new(DiskBufferedDelivery { runner, temp_dir }),
    }
}

pub struct StreamingDelivery {
    runner: MediaRunner,
}

#[async_trait]
impl DeliveryStrategy for StreamingDelivery {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Streaming
    }

    async fn passthrough(
        &self,
        ctx: JobContext,
        source: SourceStream,
    ) -> Result<Delivered, AppError> {
        Ok(Delivered {
            body: bounded(source.body, ctx.cancel, ctx.deadline, ctx.workspace),
            content_length: source.content_length,
        })
    }

    async fn process(&self, ctx: JobContext, job: MediaJob) -> Result<Delivered, AppError> {
        let output = self
            .runner
            .run(job, OutputSink::Pipe, ctx.cancel.clone(), ctx.deadline)
            .await?;
        let stream = match output {
            MediaOutput::Stream(stream) => stream,
            MediaOutput::File(path) => {
                return Err(AppError::Internal(format!(
                    "pipe job produced a file: {}",
                    path.display()
                )))
            }
        };
        Ok(Delivered {
            body: bounded(stream, ctx.cancel, ctx.deadline, ctx.workspace),
            content_length: None,
        })
    }
}

pub struct DiskBufferedDelivery {
    runner: MediaRunner,
    temp_dir: PathBuf,
}

impl DiskBufferedDelivery {
    async fn workspace(&self, existing: Option<Workspace>) -> Result<Workspace, AppError> {
        match existing {
            Some(ws) => Ok(ws),
            None => Workspace::create(&self.temp_dir)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create workspace: {e}"))),
        }
    }
}

#[async_trait]
impl DeliveryStrategy for DiskBufferedDelivery {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::DiskBuffered
    }

    async fn passthrough(
        &self,
        ctx: JobContext,
        source: SourceStream,
    ) -> Result<Delivered, AppError> {
        let workspace = self.workspace(ctx.workspace).await?;
        let path = workspace.file(&format!("source.{}", source.descriptor.container));
        write_stream_to_file(
            source.descriptor.identifier.as_str(),
            source.body,
            &path,
            &ctx.cancel,
            ctx.deadline,
        )
        .await?;
        serve_file(&path, workspace, ctx.cancel, ctx.deadline).await
    }

    async fn process(&self, ctx: JobContext, job: MediaJob) -> Result<Delivered, AppError> {
        let workspace = self.workspace(ctx.workspace).await?;
        let ext = match job.operation {
            Operation::TranscodeMp3 { .. } => "mp3",
            Operation::Remux => "mp4",
        };
        let output = workspace.file(&format!("output.{ext}"));

        let path = match self
            .runner
            .run(job, OutputSink::File(output), ctx.cancel.clone(), ctx.deadline)
            .await?
        {
            MediaOutput::File(path) => path,
            MediaOutput::Stream(_) => {
                return Err(AppError::Internal("file job produced a stream".into()))
            }
        };
        serve_file(&path, workspace, ctx.cancel, ctx.deadline).await
    }
}

async fn serve_file(
    path: &Path,
    workspace: Workspace,
    cancel: CancellationToken,
    deadline: Instant,
) -> Result<Delivered, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to open {}: {e}", path.display())))?;
    let content_length = file.metadata().await.ok().map(|m| m.len());
    info!("Serving {} ({content_length:?} bytes)", path.display());

    Ok(Delivered {
        body: bounded(
            ReaderStream::new(file).boxed(),
            cancel,
            deadline,
            Some(workspace),
        ),
        content_length,
    })
}

/// Drain `stream` into a new file at `path`, returning the byte count.
pub async fn write_stream_to_file(
    name: &str,
    mut stream: ByteStream,
    path: &Path,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to create {}: {e}", path.display())))?;
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(AppError::TimedOut),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| AppError::Internal(format!("Failed to write {name}: {e}")))?;
                written += chunk.len() as u64;
            }
            Some(Err(e)) => return Err(SourceError::Interrupted(e).into()),
            None => break,
        }
    }

    file.flush()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to flush {name}: {e}")))?;
    debug!("Stored {name}: {written} bytes at {}", path.display());
    Ok(written)
}

struct Bounded {
    inner: ByteStream,
    cancel: CancellationToken,
    sleep: Pin<Box<Sleep>>,
    done: bool,
    _workspace: Option<Workspace>,
}

enum Step {
    Item(Option<io::Result<axum::body::Bytes>>),
    Cancelled,
    Expired,
}

/// Cap a body by the request deadline and cancellation. The body also owns the
/// workspace, so its files go away exactly when the response is finished or
/// dropped.
pub fn bounded(
    inner: ByteStream,
    cancel: CancellationToken,
    deadline: Instant,
    workspace: Option<Workspace>,
) -> ByteStream {
    let state = Bounded {
        inner,
        cancel,
        sleep: Box::pin(tokio::time::sleep_until(deadline)),
        done: false,
        _workspace: workspace,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        let step = tokio::select! {
            biased;
            _ = st.cancel.cancelled() => Step::Cancelled,
            _ = &mut st.sleep => Step::Expired,
            item = st.inner.next() => Step::Item(item),
        };
        match step {
            Step::Item(item) => item.map(|chunk| (chunk, st)),
            Step::Cancelled => {
                st.done = true;
                let err = io::Error::new(io::ErrorKind::Interrupted, "download cancelled");
                Some((Err(err), st))
            }
            Step::Expired => {
                st.done = true;
                let err = io::Error::new(io::ErrorKind::TimedOut, "download deadline exceeded");
                Some((Err(err), st))
            }
        }
    })
    .boxed()
}

//! In-memory stream source for tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::StreamExt;

use crate::request::VideoReference;
use crate::source::{
    parse_info, tests::sample_info_json, SourceError, SourceStream, StreamDescriptor,
    StreamSource, VideoInfo,
};

#[derive(Clone, Copy)]
pub enum Chunk {
    Data(&'static str),
    /// The connection drops.
    Fail,
    /// The remote stops sending without closing.
    Stall,
}

#[derive(Default)]
pub struct FakeSource {
    streams: HashMap<String, (StreamDescriptor, Vec<Chunk>)>,
    probes: AtomicUsize,
    opens: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, id: &str, has_video: bool, has_audio: bool, chunks: Vec<Chunk>) -> Self {
        let descriptor = StreamDescriptor {
            identifier: id.to_string(),
            container: if has_video { "mp4".into() } else { "m4a".into() },
            quality_label: if has_video { "360p".into() } else { "128kbps".into() },
            has_video,
            has_embedded_audio: has_audio,
            bitrate: None,
            height: has_video.then_some(360),
        };
        self.streams.insert(id.to_string(), (descriptor, chunks));
        self
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for FakeSource {
    async fn probe(&self, _reference: &VideoReference) -> Result<VideoInfo, SourceError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        parse_info(&sample_info_json())
    }

    async fn open(&self, _info: &VideoInfo, stream_id: &str) -> Result<SourceStream, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (descriptor, chunks) = self
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| SourceError::StreamNotFound(stream_id.to_string()))?;

        let content_length = chunks
            .iter()
            .map(|c| match c {
                Chunk::Data(d) => Some(d.len() as u64),
                Chunk::Fail | Chunk::Stall => None,
            })
            .sum::<Option<u64>>();

        let body = futures_util::stream::iter(chunks)
            .then(|chunk| async move {
                match chunk {
                    Chunk::Data(d) => Some(Ok(Bytes::from_static(d.as_bytes()))),
                    Chunk::Fail => Some(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset",
                    ))),
                    Chunk::Stall => futures_util::future::pending().await,
                }
            })
            .filter_map(futures_util::future::ready)
            .boxed();

        Ok(SourceStream {
            descriptor,
            content_length,
            body,
        })
    }
}

//! Maps logical byte ranges of a blob onto its fixed-size chunks.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;

use crate::error::IoError;
use crate::io::IoOps;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::metrics::SharedMetrics;
use crate::object::FdsObject;

/// Metadata attribute holding the logical length of a blob in bytes.
pub const LENGTH_KEY: &str = "length";

/// The part of one chunk covered by a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkSpan {
    index: u64,
    /// Range within the chunk.
    local_start: usize,
    local_end: usize,
    /// Position of `local_start` within the caller's buffer.
    data_start: usize,
}

impl ChunkSpan {
    fn len(&self) -> usize {
        self.local_end - self.local_start
    }

    fn covers(&self, object_size: usize) -> bool {
        self.local_start == 0 && self.local_end == object_size
    }

    fn data_range(&self) -> std::ops::Range<usize> {
        self.data_start..self.data_start + self.len()
    }
}

struct ChunkSpans {
    object_size: u64,
    base: u64,
    pos: u64,
    end: u64,
}

impl ChunkSpans {
    fn new(object_size: usize, offset: u64, len: u64) -> Self {
        Self {
            object_size: object_size as u64,
            base: offset,
            pos: offset,
            end: offset + len,
        }
    }
}

impl Iterator for ChunkSpans {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.pos >= self.end {
            return None;
        }
        let index = self.pos / self.object_size;
        let local_start = self.pos % self.object_size;
        let chunk_end = ((index + 1) * self.object_size).min(self.end);
        let span = ChunkSpan {
            index,
            local_start: local_start as usize,
            local_end: (local_start + chunk_end - self.pos) as usize,
            data_start: (self.pos - self.base) as usize,
        };
        self.pos = chunk_end;
        Some(span)
    }
}

fn check_object_size(object_size: usize) -> Result<(), IoError> {
    if object_size == 0 {
        return Err(IoError::invalid("object size must be positive"));
    }
    Ok(())
}

/// Reads the recorded length out of blob metadata.
pub fn recorded_length(metadata: &Metadata) -> Result<Option<u64>, IoError> {
    metadata
        .get(LENGTH_KEY)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| IoError::Codec(format!("invalid blob length {:?}", value)))
        })
        .transpose()
}

/// Splits byte-range reads and writes into chunk operations.
///
/// Chunks never written read as zero, wherever they sit in the blob.
#[derive(Clone)]
pub struct Chunker {
    io: Arc<dyn IoOps>,
    metrics: SharedMetrics,
}

impl Chunker {
    pub fn new(io: Arc<dyn IoOps>) -> Self {
        Self::with_metrics(io, SharedMetrics::default())
    }

    pub fn with_metrics(io: Arc<dyn IoOps>, metrics: SharedMetrics) -> Self {
        Self { io, metrics }
    }

    pub fn io(&self) -> &Arc<dyn IoOps> {
        &self.io
    }

    /// Writes `data` at `offset` and returns the new recorded length, which
    /// is the largest of the previous length, the end of the write and
    /// `new_blob_length`.
    pub async fn write(
        &self,
        blob: &MetaKey,
        object_size: usize,
        data: &[u8],
        offset: u64,
        new_blob_length: Option<u64>,
    ) -> Result<u64, IoError> {
        check_object_size(object_size)?;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            IoError::invalid(format!("write of {} bytes at {} overflows", data.len(), offset))
        })?;

        let data = Bytes::copy_from_slice(data);
        let spans = ChunkSpans::new(object_size, offset, data.len() as u64);
        try_join_all(spans.map(|span| {
            let bytes = data.slice(span.data_range());
            self.write_span(blob, object_size, span, bytes)
        }))
        .await?;
        self.metrics.bytes_written(data.len());

        // An empty write leaves the length alone unless asked to extend it.
        let written_end = if data.is_empty() { 0 } else { end };
        let floor = written_end.max(new_blob_length.unwrap_or(0));
        let metadata = self
            .io
            .mutate_metadata(
                blob,
                Arc::new(move |current: Option<Metadata>| -> Result<Metadata, IoError> {
                    let mut metadata = current.unwrap_or_default();
                    let previous = recorded_length(&metadata)?.unwrap_or(0);
                    metadata.insert(LENGTH_KEY.to_string(), previous.max(floor).to_string());
                    Ok(metadata)
                }),
            )
            .await?;
        Ok(recorded_length(&metadata)?.unwrap_or(floor))
    }

    async fn write_span(
        &self,
        blob: &MetaKey,
        object_size: usize,
        span: ChunkSpan,
        bytes: Bytes,
    ) -> Result<(), IoError> {
        let key = blob.object(span.index);
        if span.covers(object_size) {
            self.io
                .write_object(&key, FdsObject::new(bytes, object_size)?)
                .await?;
        } else {
            self.metrics.read_before_write();
            let local_start = span.local_start;
            self.io
                .mutate_object(
                    &key,
                    object_size,
                    Arc::new(move |current: Option<FdsObject>| {
                        current
                            .unwrap_or_else(|| FdsObject::empty(object_size))
                            .splice(local_start, &bytes)
                    }),
                )
                .await?;
        }
        self.metrics.chunk_written();
        Ok(())
    }

    /// Fills `dest` from `offset`, clipped to `blob_length`, and returns the
    /// number of bytes copied.
    pub async fn read(
        &self,
        blob: &MetaKey,
        blob_length: u64,
        object_size: usize,
        dest: &mut [u8],
        offset: u64,
    ) -> Result<usize, IoError> {
        check_object_size(object_size)?;
        if offset >= blob_length || dest.is_empty() {
            return Ok(0);
        }
        let len = (blob_length - offset).min(dest.len() as u64) as usize;

        let spans: Vec<ChunkSpan> = ChunkSpans::new(object_size, offset, len as u64).collect();
        let keys: Vec<ObjectKey> = spans.iter().map(|s| blob.object(s.index)).collect();
        let objects =
            try_join_all(keys.iter().map(|key| self.io.read_object(key, object_size))).await?;

        for (span, object) in spans.iter().zip(objects) {
            let target = &mut dest[span.data_range()];
            match object {
                Some(object) => object.read_into(span.local_start, target),
                None => target.fill(0),
            }
            self.metrics.chunk_read();
        }
        self.metrics.bytes_read(len);
        Ok(len)
    }

    /// Like [`Chunker::read`], with the length taken from the blob's
    /// metadata.
    pub async fn read_blob(
        &self,
        blob: &MetaKey,
        object_size: usize,
        dest: &mut [u8],
        offset: u64,
    ) -> Result<usize, IoError> {
        let length = self
            .blob_length(blob)
            .await?
            .ok_or_else(|| IoError::not_found(blob))?;
        self.read(blob, length, object_size, dest, offset).await
    }

    pub async fn blob_length(&self, blob: &MetaKey) -> Result<Option<u64>, IoError> {
        match self.io.read_metadata(blob).await? {
            Some(metadata) => recorded_length(&metadata),
            None => Ok(None),
        }
    }

    /// Sets the recorded length. Bytes past a reduced length are dropped, so
    /// extending the blob again exposes zeros.
    pub async fn truncate(
        &self,
        blob: &MetaKey,
        object_size: usize,
        new_length: u64,
    ) -> Result<(), IoError> {
        check_object_size(object_size)?;
        let current = self.blob_length(blob).await?.unwrap_or(0);

        if new_length < current {
            let size = object_size as u64;
            let boundary = new_length / size;
            let cut = (new_length % size) as usize;
            let first = if cut > 0 {
                self.cut_chunk(blob, object_size, boundary, cut).await?;
                boundary + 1
            } else {
                boundary
            };
            self.io
                .delete_objects_from(blob, ObjectOffset::new(first))
                .await?;
        }

        self.io
            .mutate_metadata(
                blob,
                Arc::new(move |current: Option<Metadata>| -> Result<Metadata, IoError> {
                    let mut metadata = current.unwrap_or_default();
                    metadata.insert(LENGTH_KEY.to_string(), new_length.to_string());
                    Ok(metadata)
                }),
            )
            .await?;
        Ok(())
    }

    async fn cut_chunk(
        &self,
        blob: &MetaKey,
        object_size: usize,
        index: u64,
        limit: usize,
    ) -> Result<(), IoError> {
        let key = blob.object(index);
        self.io
            .mutate_object(
                &key,
                object_size,
                Arc::new(move |current: Option<FdsObject>| -> Result<FdsObject, IoError> {
                    Ok(current
                        .map(|object| object.truncate(limit))
                        .unwrap_or_else(|| FdsObject::empty(object_size)))
                }),
            )
            .await?;
        Ok(())
    }
}

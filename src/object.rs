use bytes::{Bytes, BytesMut};

use crate::error::IoError;

/// View over the bytes of one chunk.
///
/// `limit` is the number of bytes physically present; it never exceeds
/// `max_object_size`. Bytes between the limit and the maximum size are
/// logically zero. The value is immutable: every modification returns a new
/// object and the underlying `Bytes` is shared between clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdsObject {
    data: Bytes,
    max_object_size: usize,
}

impl FdsObject {
    pub fn new(data: impl Into<Bytes>, max_object_size: usize) -> Result<Self, IoError> {
        let data = data.into();
        if data.len() > max_object_size {
            return Err(IoError::invalid(format!(
                "object of {} bytes exceeds maximum object size {}",
                data.len(),
                max_object_size
            )));
        }
        Ok(Self {
            data,
            max_object_size,
        })
    }

    /// An object with no bytes present.
    pub fn empty(max_object_size: usize) -> Self {
        Self {
            data: Bytes::new(),
            max_object_size,
        }
    }

    /// Wraps a fixed-capacity buffer; the buffer length becomes the limit.
    pub fn from_buffer(buffer: BytesMut, max_object_size: usize) -> Result<Self, IoError> {
        Self::new(buffer.freeze(), max_object_size)
    }

    /// Copies the present bytes into a buffer with capacity for a full chunk.
    pub fn to_buffer(&self) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(self.max_object_size);
        buffer.extend_from_slice(&self.data);
        buffer
    }

    pub fn limit(&self) -> usize {
        self.data.len()
    }

    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Fills `dest` with the bytes starting at `offset`, zero past the limit.
    pub fn read_into(&self, offset: usize, dest: &mut [u8]) {
        let present = self.data.len().saturating_sub(offset).min(dest.len());
        if present > 0 {
            dest[..present].copy_from_slice(&self.data[offset..offset + present]);
        }
        dest[present..].fill(0);
    }

    /// Returns a copy with `bytes` placed at `offset`. A gap between the
    /// current limit and `offset` is zero-filled.
    pub fn splice(&self, offset: usize, bytes: &[u8]) -> Result<Self, IoError> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= self.max_object_size)
            .ok_or_else(|| {
                IoError::invalid(format!(
                    "splice of {} bytes at {} exceeds maximum object size {}",
                    bytes.len(),
                    offset,
                    self.max_object_size
                ))
            })?;

        let mut buffer = BytesMut::with_capacity(self.max_object_size);
        buffer.extend_from_slice(&self.data);
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset..end].copy_from_slice(bytes);
        Ok(Self {
            data: buffer.freeze(),
            max_object_size: self.max_object_size,
        })
    }

    /// Returns a copy whose limit is at most `limit`.
    pub fn truncate(&self, limit: usize) -> Self {
        Self {
            data: self.data.slice(..limit.min(self.data.len())),
            max_object_size: self.max_object_size,
        }
    }
}

//! Remote read streaming with offset tracking

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::debug;

use crate::error::{FsError, Result};
use crate::remote::{ByteStream, RemoteStore};

/// Read side of a handle: one lazily opened remote stream.
///
/// The stream cannot seek. A read at any offset other than the one following
/// the previous read discards the stream and opens a new one there.
#[derive(Default)]
pub struct ReadStream {
    stream: Option<ByteStream>,
    /// Bytes received from the stream but not yet returned
    leftover: Bytes,
    expected_offset: u64,
    opened: u64,
}

impl ReadStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_offset(&self) -> u64 {
        self.expected_offset
    }

    /// Number of remote streams opened so far
    pub fn streams_opened(&self) -> u64 {
        self.opened
    }

    pub async fn read(
        &mut self,
        remote: &dyn RemoteStore,
        path: &str,
        length: usize,
        offset: u64,
    ) -> Result<Bytes> {
        if self.stream.is_none() || self.expected_offset != offset {
            if self.stream.is_some() {
                debug!(
                    path = %path,
                    expected = self.expected_offset,
                    requested = offset,
                    "requested offset differs from expected offset, reopening"
                );
            }
            self.stream = None;
            self.leftover = Bytes::new();
            let stream = remote
                .download(path, offset)
                .await
                .map_err(FsError::remote("download"))?;
            self.stream = Some(stream);
            self.expected_offset = offset;
            self.opened += 1;
        }

        let mut out = BytesMut::with_capacity(length);
        if !self.leftover.is_empty() {
            let take = self.leftover.len().min(length);
            out.extend_from_slice(&self.leftover.split_to(take));
        }

        while out.len() < length {
            let Some(stream) = self.stream.as_mut() else {
                break;
            };
            match stream.next().await {
                Some(Ok(mut chunk)) => {
                    let need = length - out.len();
                    if chunk.len() > need {
                        self.leftover = chunk.split_off(need);
                    }
                    out.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    // Position is unknown now; next read reopens
                    self.stream = None;
                    self.leftover = Bytes::new();
                    return Err(FsError::remote("read")(e));
                }
                None => break,
            }
        }

        self.expected_offset = offset + out.len() as u64;
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("open", &self.stream.is_some())
            .field("buffered", &self.leftover.len())
            .field("expected_offset", &self.expected_offset)
            .finish()
    }
}

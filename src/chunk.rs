//! The streaming chunker.
//!
//! Slices an unbounded async byte source into a lazy, finite sequence of
//! DataUnits no larger than `block_size`. Never buffers more than one
//! block and never coalesces across end-of-stream: the final item may be
//! shorter than `block_size`, and an empty source yields an empty
//! sequence.

use crate::error::{CoreError, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Pull-based chunker over any `AsyncRead` source.
pub struct Chunker<R> {
    source: R,
    block_size: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(source: R, block_size: usize) -> Self {
        Self {
            source,
            block_size,
            done: false,
        }
    }

    /// Pull the next DataUnit, if any.
    ///
    /// Returns `None` once the source is exhausted. A single `Err` item
    /// terminates the sequence — subsequent calls return `None`.
    pub async fn next_unit(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }

        let mut buf = BytesMut::zeroed(self.block_size);
        let mut filled = 0usize;
        while filled < self.block_size {
            match self.source.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(CoreError::UpstreamRead(e.to_string())));
                }
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }

        buf.truncate(filled);
        if filled < self.block_size {
            // Short read can only happen at end-of-stream for this source.
            self.done = true;
        }
        Some(Ok(buf.freeze()))
    }
}

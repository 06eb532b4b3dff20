//! Fixed-block byte transfers between a client and the server.
//!
//! Firmware images move over the websocket in blocks no larger than the
//! configured message size. [`InboundTransfer`] collects an upload into a
//! temporary file; [`OutboundTransfer`] hands out a buffered image one block
//! at a time.

use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("block of {block} bytes overflows the declared size ({received} of {total} bytes received)")]
    BlockTooLarge {
        block: usize,
        received: usize,
        total: usize,
    },

    #[error("no transfer in progress")]
    NotStarted,

    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulates an uploaded image of a declared size.
#[derive(Debug, Default)]
pub struct InboundTransfer {
    buffer: Vec<u8>,
    total: usize,
    active: bool,
}

impl InboundTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and expect `total` bytes.
    pub fn start(&mut self, total: usize) {
        self.buffer = Vec::with_capacity(total);
        self.total = total;
        self.active = true;
    }

    /// Append a block. Returns `true` on the block that completes the image.
    ///
    /// A block that would overflow the declared size is rejected whole and
    /// leaves the received bytes untouched. Once complete, further blocks
    /// are rejected as well.
    pub fn add_block(&mut self, block: &[u8]) -> Result<bool, TransferError> {
        if !self.active {
            return Err(TransferError::NotStarted);
        }
        if self.buffer.len() + block.len() > self.total || self.is_complete() {
            return Err(TransferError::BlockTooLarge {
                block: block.len(),
                received: self.buffer.len(),
                total: self.total,
            });
        }

        self.buffer.extend_from_slice(block);
        Ok(self.is_complete())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_complete(&self) -> bool {
        self.active && self.buffer.len() == self.total
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Write the received image to a fresh temporary file.
    ///
    /// The file is deleted when the returned handle drops.
    pub fn persist(&self, dir: Option<&Path>) -> Result<NamedTempFile, TransferError> {
        let mut file = match dir {
            Some(dir) => tempfile::Builder::new()
                .prefix("firmware-")
                .suffix(".hex")
                .tempfile_in(dir)?,
            None => tempfile::Builder::new()
                .prefix("firmware-")
                .suffix(".hex")
                .tempfile()?,
        };
        file.write_all(&self.buffer)?;
        file.flush()?;
        Ok(file)
    }

    /// Drop the buffer and return to the idle state.
    pub fn clear(&mut self) {
        self.buffer = Vec::new();
        self.total = 0;
        self.active = false;
    }
}

/// Serves a fixed image in blocks of at most `block_size` bytes.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    source: Bytes,
    block_size: usize,
    cursor: usize,
}

impl OutboundTransfer {
    /// `block_size` of zero is treated as one.
    pub fn new(source: Bytes, block_size: usize) -> Self {
        Self {
            source,
            block_size: block_size.max(1),
            cursor: 0,
        }
    }

    /// Next block, or an empty one once finished.
    pub fn pop_block(&mut self) -> Bytes {
        let end = (self.cursor + self.block_size).min(self.source.len());
        let block = self.source.slice(self.cursor..end);
        self.cursor = end;
        block
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.source.len()
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

//! Sequential block file
//!
//! Channels of one stream are written one at a time, but the file stores
//! them interleaved (`s0c0 s0c1 ... s1c0 s1c1 ...`). Incoming channel data
//! is scattered into in-memory blocks of `samples_per_block` samples for all
//! channels; a block is appended to the file once every channel has moved
//! past it. On close the remaining blocks are flushed in order and the last
//! one is truncated to the samples actually written, so the file never ends
//! in padding.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::FormatError;

/// Output stream buffer
const STREAM_BUFFER_SIZE: usize = 262_144;

/// One in-memory block covering `samples_per_block` samples of every channel
#[derive(Debug)]
struct FileBlock {
    /// Sample position of the first sample in the block
    offset: u64,
    data: Vec<i16>,
}

impl FileBlock {
    fn new(offset: u64, len: usize) -> Self {
        Self {
            offset,
            data: vec![0; len],
        }
    }
}

/// Interleaved `i16` file assembled from per-channel writes
pub struct SequentialBlockFile {
    path: PathBuf,
    writer: BufWriter<File>,
    n_channels: usize,
    samples_per_block: usize,
    blocks: VecDeque<FileBlock>,
    /// Index into `blocks` of the last block each channel wrote to
    current_block: Vec<Option<usize>>,
    /// Samples written into the newest block
    last_block_fill: usize,
    bytes_written: u64,
    scratch: Vec<u8>,
    closed: bool,
}

impl SequentialBlockFile {
    pub fn create(
        path: impl AsRef<Path>,
        n_channels: usize,
        samples_per_block: usize,
    ) -> Result<Self, FormatError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut blocks = VecDeque::new();
        blocks.push_back(FileBlock::new(0, n_channels * samples_per_block));
        debug!(path = %path.display(), n_channels, samples_per_block, "Opened block file");

        Ok(Self {
            path,
            writer: BufWriter::with_capacity(STREAM_BUFFER_SIZE, file),
            n_channels,
            samples_per_block,
            blocks,
            current_block: vec![None; n_channels],
            last_block_fill: 0,
            bytes_written: 0,
            scratch: Vec::new(),
            closed: false,
        })
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended to the file so far (excludes blocks still in memory)
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write `data` for `channel` starting at sample position `start_pos`.
    ///
    /// Returns `Ok(false)` if the target block has already been flushed,
    /// i.e. the channel lagged behind the others by more than the blocks
    /// kept in memory.
    pub fn write_channel(
        &mut self,
        start_pos: u64,
        channel: usize,
        data: &[i16],
    ) -> Result<bool, FormatError> {
        if channel >= self.n_channels {
            return Err(FormatError::ChannelOutOfRange {
                channel,
                n_channels: self.n_channels,
            });
        }
        if data.is_empty() {
            return Ok(true);
        }

        let spb = self.samples_per_block as u64;
        let end = start_pos + data.len() as u64;
        let needs_space = self
            .blocks
            .back()
            .map_or(true, |last| last.offset + spb < end);
        if needs_space {
            self.allocate_blocks(end)?;
        }

        let Some(mut b_index) = self.blocks.iter().rposition(|b| b.offset <= start_pos) else {
            warn!(
                channel,
                start_pos,
                n_samples = data.len(),
                current_blocks = ?self.current_block,
                "Memory block unloaded ahead of time"
            );
            return Ok(false);
        };

        let last_index = self.blocks.len() - 1;
        let mut start_idx = (start_pos - self.blocks[b_index].offset) as usize;
        let mut written = 0;

        while written < data.len() {
            let to_write = (data.len() - written).min(self.samples_per_block - start_idx);
            let block = &mut self.blocks[b_index].data;
            for (i, &sample) in data[written..written + to_write].iter().enumerate() {
                block[(start_idx + i) * self.n_channels + channel] = sample;
            }
            written += to_write;

            let fill = start_idx + to_write;
            if b_index == last_index && fill > self.last_block_fill {
                self.last_block_fill = fill;
            }

            start_idx = 0;
            b_index += 1;
        }

        self.current_block[channel] = Some(b_index - 1);
        Ok(true)
    }

    /// Flush blocks every channel has moved past, then append enough new
    /// blocks to hold samples up to `end`.
    fn allocate_blocks(&mut self, end: u64) -> Result<(), FormatError> {
        // Channels that have not written yet pin the first block.
        let min_block = self
            .current_block
            .iter()
            .map(|c| c.unwrap_or(0))
            .min()
            .unwrap_or(0)
            .min(self.blocks.len().saturating_sub(1));

        for _ in 0..min_block {
            if let Some(block) = self.blocks.pop_front() {
                self.flush_block(&block, block.data.len())?;
            }
        }
        for current in self.current_block.iter_mut().flatten() {
            *current -= min_block;
        }

        let spb = self.samples_per_block as u64;
        let mut last_offset = self.blocks.back().map_or(0, |b| b.offset);
        let needed = end.saturating_sub(last_offset + spb);
        let new_blocks = needed.div_ceil(spb);

        for _ in 0..new_blocks {
            last_offset += spb;
            self.blocks
                .push_back(FileBlock::new(last_offset, self.n_channels * self.samples_per_block));
        }
        if new_blocks > 0 {
            self.last_block_fill = 0;
        }
        Ok(())
    }

    fn flush_block(&mut self, block: &FileBlock, n_values: usize) -> Result<(), FormatError> {
        self.scratch.clear();
        self.scratch.reserve(n_values * 2);
        for &v in &block.data[..n_values] {
            self.scratch.extend_from_slice(&v.to_le_bytes());
        }
        self.writer.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), FormatError> {
        self.closed = true;
        while let Some(block) = self.blocks.pop_front() {
            let n_values = if self.blocks.is_empty() {
                self.last_block_fill * self.n_channels
            } else {
                block.data.len()
            };
            self.flush_block(&block, n_values)?;
        }
        self.writer.flush()?;
        debug!(path = %self.path.display(), bytes = self.bytes_written, "Closed block file");
        Ok(())
    }

    /// Flush all remaining blocks and close the file
    pub fn close(mut self) -> Result<(), FormatError> {
        self.finish()
    }
}

impl Drop for SequentialBlockFile {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.finish() {
                warn!(path = %self.path.display(), error = %e, "Failed to flush block file");
            }
        }
    }
}

impl std::fmt::Debug for SequentialBlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialBlockFile")
            .field("path", &self.path)
            .field("n_channels", &self.n_channels)
            .field("blocks_in_memory", &self.blocks.len())
            .finish()
    }
}

// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Map output writers.
//!
//! A [`ShuffleMapOutputWriter`] hands out one [`ShufflePartitionWriter`]
//! per partition, in ascending order, and commits or aborts the whole map
//! output atomically. The local-disk implementation writes one data file
//! with the partitions concatenated plus an index file of `P + 1`
//! little-endian `i64` offsets.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::io::CountingWriter;

/// Produces the map output artifact for one `(shuffle_id, map_id)`.
pub trait ShuffleWriteSupport: Send + Sync {
    fn create_map_output_writer(
        &self,
        shuffle_id: u32,
        map_id: u32,
        num_partitions: u32,
    ) -> ShuffleResult<Box<dyn ShuffleMapOutputWriter>>;
}

/// Writes one map output. Partition writers are requested in strictly
/// ascending partition order and each must be closed before the next is
/// requested.
pub trait ShuffleMapOutputWriter {
    fn next_partition_writer(&mut self) -> ShuffleResult<Box<dyn ShufflePartitionWriter + '_>>;

    /// Publishes the output. Partitions for which no writer was requested
    /// are committed with a length of zero.
    fn commit_all_partitions(&mut self) -> ShuffleResult<()>;

    /// Discards the output after a failure. Must not mask `error`.
    fn abort(&mut self, error: &ShuffleError) -> ShuffleResult<()>;
}

/// A fresh sink for a single partition, reporting only its own bytes.
pub trait ShufflePartitionWriter {
    /// A buffered stream sink for this partition.
    fn stream(&mut self) -> ShuffleResult<&mut dyn Write>;

    /// A file-descriptor channel for zero-copy transfers, or `None` when
    /// the sink is not file-backed (or a stream was already opened).
    fn channel(&mut self) -> ShuffleResult<Option<TransferChannel<'_>>>;

    fn num_bytes_written(&self) -> u64;

    fn close(&mut self) -> ShuffleResult<()>;
}

/// A writable file channel that moves bytes from another file without
/// user-space buffering where the platform allows it.
pub struct TransferChannel<'a> {
    file: &'a mut File,
    written: &'a mut u64,
}

impl<'a> TransferChannel<'a> {
    pub fn new(file: &'a mut File, written: &'a mut u64) -> Self {
        Self { file, written }
    }

    /// Transfers exactly up to `length` bytes from the source file's
    /// current position, advancing both positions.
    pub fn transfer_from(&mut self, src: &mut File, length: u64) -> ShuffleResult<u64> {
        let mut limited = (&mut *src).take(length);
        let moved = io::copy(&mut limited, &mut *self.file)?;
        *self.written += moved;
        Ok(moved)
    }
}

/// Creates [`LocalDiskShuffleMapOutputWriter`]s rooted in one directory,
/// named `shuffle_{shuffle_id}_{map_id}_0.data` / `.index`.
#[derive(Debug)]
pub struct LocalDiskShuffleWriteSupport {
    root: PathBuf,
    buffer_size: usize,
}

impl LocalDiskShuffleWriteSupport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            buffer_size: 32 * 1024,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn data_file(&self, shuffle_id: u32, map_id: u32) -> PathBuf {
        self.root
            .join(format!("shuffle_{shuffle_id}_{map_id}_0.data"))
    }

    pub fn index_file(&self, shuffle_id: u32, map_id: u32) -> PathBuf {
        self.root
            .join(format!("shuffle_{shuffle_id}_{map_id}_0.index"))
    }
}

impl ShuffleWriteSupport for LocalDiskShuffleWriteSupport {
    fn create_map_output_writer(
        &self,
        shuffle_id: u32,
        map_id: u32,
        num_partitions: u32,
    ) -> ShuffleResult<Box<dyn ShuffleMapOutputWriter>> {
        std::fs::create_dir_all(&self.root)?;
        Ok(Box::new(LocalDiskShuffleMapOutputWriter::try_new(
            self.data_file(shuffle_id, map_id),
            self.index_file(shuffle_id, map_id),
            num_partitions,
            self.buffer_size,
        )?))
    }
}

/// Writes all partitions into one temporary data file and commits by
/// renaming it together with the offset index.
pub struct LocalDiskShuffleMapOutputWriter {
    data_path: PathBuf,
    index_path: PathBuf,
    data_tmp_path: PathBuf,
    file: File,
    buffer_size: usize,
    partition_lengths: Vec<u64>,
    current_partition: Option<usize>,
    partition_start: u64,
    next_partition: u32,
    num_partitions: u32,
    committed: bool,
}

impl LocalDiskShuffleMapOutputWriter {
    pub fn try_new(
        data_path: PathBuf,
        index_path: PathBuf,
        num_partitions: u32,
        buffer_size: usize,
    ) -> ShuffleResult<Self> {
        let data_tmp_path = tmp_sibling(&data_path);
        let file = File::create(&data_tmp_path)?;
        Ok(Self {
            data_path,
            index_path,
            data_tmp_path,
            file,
            buffer_size,
            partition_lengths: vec![0; num_partitions as usize],
            current_partition: None,
            partition_start: 0,
            next_partition: 0,
            num_partitions,
            committed: false,
        })
    }

    pub fn partition_lengths(&self) -> &[u64] {
        &self.partition_lengths
    }

    fn finalize_current_partition(&mut self) -> ShuffleResult<()> {
        if let Some(partition) = self.current_partition.take() {
            let position = self.file.stream_position()?;
            self.partition_lengths[partition] = position - self.partition_start;
            self.partition_start = position;
        }
        Ok(())
    }
}

impl ShuffleMapOutputWriter for LocalDiskShuffleMapOutputWriter {
    fn next_partition_writer(&mut self) -> ShuffleResult<Box<dyn ShufflePartitionWriter + '_>> {
        if self.committed {
            return Err(ShuffleError::IllegalState(
                "map output writer already committed".to_string(),
            ));
        }
        if self.next_partition >= self.num_partitions {
            return Err(ShuffleError::IllegalState(format!(
                "requested more than {} partition writers",
                self.num_partitions
            )));
        }
        self.finalize_current_partition()?;
        self.current_partition = Some(self.next_partition as usize);
        self.next_partition += 1;
        Ok(Box::new(LocalDiskPartitionWriter {
            file: self.file.try_clone()?,
            buffer_size: self.buffer_size,
            sink: None,
            channel_bytes: 0,
            closed: false,
        }))
    }

    fn commit_all_partitions(&mut self) -> ShuffleResult<()> {
        if self.committed {
            return Err(ShuffleError::IllegalState(
                "map output writer already committed".to_string(),
            ));
        }
        self.finalize_current_partition()?;

        let index_tmp_path = tmp_sibling(&self.index_path);
        {
            let mut index = BufWriter::new(File::create(&index_tmp_path)?);
            let mut offset = 0i64;
            index.write_all(&offset.to_le_bytes())?;
            for length in &self.partition_lengths {
                offset += *length as i64;
                index.write_all(&offset.to_le_bytes())?;
            }
            index.flush()?;
        }

        std::fs::rename(&self.data_tmp_path, &self.data_path)?;
        if let Err(e) = std::fs::rename(&index_tmp_path, &self.index_path) {
            // a failed index rename must not leave a committed data file
            let _ = std::fs::rename(&self.data_path, &self.data_tmp_path);
            return Err(e.into());
        }
        self.committed = true;
        Ok(())
    }

    fn abort(&mut self, _error: &ShuffleError) -> ShuffleResult<()> {
        if !self.committed && self.data_tmp_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.data_tmp_path) {
                log::error!(
                    "Error while deleting temporary map output {}: {e}",
                    self.data_tmp_path.display()
                );
            }
        }
        Ok(())
    }
}

impl Drop for LocalDiskShuffleMapOutputWriter {
    fn drop(&mut self) {
        if !self.committed && self.data_tmp_path.exists() {
            let _ = std::fs::remove_file(&self.data_tmp_path);
        }
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

struct LocalDiskPartitionWriter {
    file: File,
    buffer_size: usize,
    sink: Option<CountingWriter<BufWriter<File>>>,
    channel_bytes: u64,
    closed: bool,
}

impl ShufflePartitionWriter for LocalDiskPartitionWriter {
    fn stream(&mut self) -> ShuffleResult<&mut dyn Write> {
        if self.closed {
            return Err(ShuffleError::IllegalState(
                "partition writer already closed".to_string(),
            ));
        }
        if self.sink.is_none() {
            let buffered = BufWriter::with_capacity(self.buffer_size, self.file.try_clone()?);
            self.sink = Some(CountingWriter::new(buffered));
        }
        match self.sink.as_mut() {
            Some(sink) => Ok(sink),
            None => unreachable!("sink was just created"),
        }
    }

    fn channel(&mut self) -> ShuffleResult<Option<TransferChannel<'_>>> {
        if self.closed {
            return Err(ShuffleError::IllegalState(
                "partition writer already closed".to_string(),
            ));
        }
        if self.sink.is_some() {
            // the partition is already being written through a stream
            return Ok(None);
        }
        Ok(Some(TransferChannel::new(
            &mut self.file,
            &mut self.channel_bytes,
        )))
    }

    fn num_bytes_written(&self) -> u64 {
        let streamed = self.sink.as_ref().map_or(0, |sink| sink.count());
        streamed + self.channel_bytes
    }

    fn close(&mut self) -> ShuffleResult<()> {
        if !self.closed {
            if let Some(sink) = self.sink.as_mut() {
                sink.flush()?;
            }
            self.closed = true;
        }
        Ok(())
    }
}

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

//! External sorter that orders serialized records by partition id only.
//!
//! Records are packed into memory pages as `{len: u32 LE, bytes}` entries
//! and addressed through packed pointers. One integer comparison on the
//! packed words sorts by partition id with ties left in insertion order,
//! because page numbers and in-page offsets grow monotonically between
//! spills.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ShuffleConfig;
use crate::errors::{ShuffleError, ShuffleResult};
use crate::memory::TaskMemoryManager;
use crate::shuffle::codec::CompressionCodec;
use crate::shuffle::io::{CountingWriter, TimeTrackingWriter};
use crate::shuffle::metrics::{ShuffleWriteMetrics, TaskWriteMetrics};
use crate::shuffle::serializer::{BlockId, SerializerManager};

const PARTITION_ID_BITS: u32 = 24;
const PAGE_NUMBER_BITS: u32 = 13;
const OFFSET_BITS: u32 = 27;

pub(crate) const MAXIMUM_PARTITIONS: u32 = 1 << PARTITION_ID_BITS;
const MAXIMUM_PAGES: usize = 1 << PAGE_NUMBER_BITS;
const MAXIMUM_PAGE_SIZE: usize = 1 << OFFSET_BITS;

const RECORD_LENGTH_PREFIX: usize = 4;

fn pack_pointer(partition_id: u32, page_number: usize, offset: usize) -> u64 {
    debug_assert!(partition_id < MAXIMUM_PARTITIONS);
    debug_assert!(page_number < MAXIMUM_PAGES);
    debug_assert!(offset < MAXIMUM_PAGE_SIZE);
    ((partition_id as u64) << (PAGE_NUMBER_BITS + OFFSET_BITS))
        | ((page_number as u64) << OFFSET_BITS)
        | offset as u64
}

fn partition_of(pointer: u64) -> u32 {
    (pointer >> (PAGE_NUMBER_BITS + OFFSET_BITS)) as u32
}

fn page_of(pointer: u64) -> usize {
    ((pointer >> OFFSET_BITS) as usize) & (MAXIMUM_PAGES - 1)
}

fn offset_of(pointer: u64) -> usize {
    (pointer as usize) & (MAXIMUM_PAGE_SIZE - 1)
}

/// Describes one spilled sorted run.
#[derive(Debug)]
pub struct SpillInfo {
    pub file: PathBuf,
    pub partition_lengths: Vec<u64>,
    pub block_id: BlockId,
}

struct Page {
    data: Vec<u8>,
    len: usize,
}

impl Page {
    fn remaining(&self) -> usize {
        self.data.len() - self.len
    }
}

struct SorterState {
    pages: Vec<Page>,
    pointers: Vec<u64>,
    /// Records the pointer array has acquired capacity for.
    pointer_capacity: usize,
    spills: Vec<SpillInfo>,
    /// Bytes currently held against the memory manager.
    allocated: u64,
    peak_allocated: u64,
    spill_count: u64,
    spilled_bytes: u64,
    next_spill_id: u64,
    closed: bool,
}

/// Sorts `(partition_id, bytes)` records in memory pages and spills sorted
/// runs to disk when the memory manager stops granting space.
pub struct ShuffleExternalSorter {
    memory: Arc<dyn TaskMemoryManager>,
    serializer_manager: Arc<dyn SerializerManager>,
    metrics: Arc<dyn ShuffleWriteMetrics>,
    codec: CompressionCodec,
    num_partitions: u32,
    page_size: usize,
    file_buffer_size: usize,
    spill_dir: PathBuf,
    state: Mutex<SorterState>,
    spilling: AtomicBool,
}

impl ShuffleExternalSorter {
    pub fn try_new(
        memory: Arc<dyn TaskMemoryManager>,
        serializer_manager: Arc<dyn SerializerManager>,
        metrics: Arc<dyn ShuffleWriteMetrics>,
        num_partitions: u32,
        config: &ShuffleConfig,
    ) -> ShuffleResult<Self> {
        std::fs::create_dir_all(&config.spill_dir)?;

        let pointer_capacity = config.init_sort_buffer_size.max(1);
        let pointer_bytes = (pointer_capacity * 8) as u64;
        let granted = memory.acquire_execution_memory(pointer_bytes);
        if granted < pointer_bytes {
            memory.release_execution_memory(granted);
            return Err(ShuffleError::MemoryExhausted(format!(
                "could not acquire {pointer_bytes} bytes for the initial sort buffer"
            )));
        }

        Ok(Self {
            memory,
            serializer_manager,
            metrics,
            codec: config.effective_codec(),
            num_partitions,
            page_size: config.page_size.min(MAXIMUM_PAGE_SIZE),
            file_buffer_size: config.file_buffer_size,
            spill_dir: config.spill_dir.clone(),
            state: Mutex::new(SorterState {
                pages: Vec::new(),
                pointers: Vec::with_capacity(pointer_capacity),
                pointer_capacity,
                spills: Vec::new(),
                allocated: pointer_bytes,
                peak_allocated: pointer_bytes,
                spill_count: 0,
                spilled_bytes: 0,
                next_spill_id: 0,
                closed: false,
            }),
            spilling: AtomicBool::new(false),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SorterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one serialized record. Spills and retries when the memory
    /// manager denies an allocation; a second denial is an error.
    pub fn insert_record(&self, payload: &[u8], partition_id: u32) -> ShuffleResult<()> {
        debug_assert!(partition_id < self.num_partitions);
        let required = payload.len() + RECORD_LENGTH_PREFIX;
        if required > MAXIMUM_PAGE_SIZE {
            return Err(ShuffleError::MemoryExhausted(format!(
                "record of {} bytes exceeds the maximum page size of {} bytes",
                payload.len(),
                MAXIMUM_PAGE_SIZE
            )));
        }

        let mut state = self.lock_state();
        if state.closed {
            return Err(ShuffleError::IllegalState(
                "insert_record called on a closed sorter".to_string(),
            ));
        }

        self.grow_pointer_array_if_necessary(&mut state)?;
        self.ensure_space_in_current_page(&mut state, required)?;

        let page_number = state.pages.len() - 1;
        let page = &mut state.pages[page_number];
        let offset = page.len;
        page.data[offset..offset + RECORD_LENGTH_PREFIX]
            .copy_from_slice(&(payload.len() as u32).to_le_bytes());
        page.data[offset + RECORD_LENGTH_PREFIX..offset + required].copy_from_slice(payload);
        page.len += required;

        let pointer = pack_pointer(partition_id, page_number, offset);
        state.pointers.push(pointer);
        Ok(())
    }

    /// Sorts and writes the in-memory records to a fresh spill file, then
    /// releases all pages. Safe to call from a memory-reclaiming thread;
    /// re-entering from within a spill is an error.
    pub fn spill(&self) -> ShuffleResult<()> {
        let mut state = self.lock_state();
        self.spill_locked(&mut state)
    }

    fn spill_locked(&self, state: &mut SorterState) -> ShuffleResult<()> {
        if self.spilling.swap(true, Ordering::SeqCst) {
            return Err(ShuffleError::IllegalState(
                "spill re-entered while a spill is in progress".to_string(),
            ));
        }
        let result = if state.pointers.is_empty() {
            Ok(())
        } else {
            log::debug!(
                "ShuffleExternalSorter spilling {} bytes of sort data to disk ({} time(s) so far)",
                state.allocated,
                state.spill_count
            );
            self.write_sorted_file(state, false)
        };
        self.spilling.store(false, Ordering::SeqCst);
        result
    }

    /// Performs the final drain (accounted as shuffle write, not spill) and
    /// hands the ordered spill list to the caller. The drain is written even
    /// when no records remain in memory, so the last spill is always the
    /// shuffle-write-counted one that the merge's double-count correction
    /// subtracts.
    pub fn close_and_get_spills(&self) -> ShuffleResult<Vec<SpillInfo>> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(ShuffleError::IllegalState(
                "close_and_get_spills called on a closed sorter".to_string(),
            ));
        }
        self.write_sorted_file(&mut state, true)?;
        state.closed = true;
        self.free_all_memory(&mut state);
        Ok(std::mem::take(&mut state.spills))
    }

    /// Releases memory and deletes any spill files still owned by this
    /// sorter. Idempotent.
    pub fn cleanup_resources(&self) -> ShuffleResult<()> {
        let mut state = self.lock_state();
        state.closed = true;
        self.free_all_memory(&mut state);
        for spill in state.spills.drain(..) {
            if spill.file.exists() {
                if let Err(e) = std::fs::remove_file(&spill.file) {
                    log::error!(
                        "Error while deleting spill file {}: {e}",
                        spill.file.display()
                    );
                }
            }
        }
        Ok(())
    }

    pub fn peak_memory_used(&self) -> u64 {
        self.lock_state().peak_allocated
    }

    pub fn spill_count(&self) -> u64 {
        self.lock_state().spill_count
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.lock_state().spilled_bytes
    }

    fn free_all_memory(&self, state: &mut SorterState) {
        for page in state.pages.drain(..) {
            let bytes = page.data.len() as u64;
            self.memory.release_execution_memory(bytes);
            state.allocated = state.allocated.saturating_sub(bytes);
        }
        state.pointers = Vec::new();
        state.pointer_capacity = 0;
        self.memory.release_execution_memory(state.allocated);
        state.allocated = 0;
    }

    fn grow_pointer_array_if_necessary(&self, state: &mut SorterState) -> ShuffleResult<()> {
        if state.pointers.len() < state.pointer_capacity {
            return Ok(());
        }
        let additional = state.pointer_capacity.max(1);
        self.acquire_or_spill(state, (additional * 8) as u64)?;
        state.pointer_capacity += additional;
        let reserve = state.pointer_capacity.saturating_sub(state.pointers.len());
        state.pointers.reserve(reserve);
        Ok(())
    }

    fn ensure_space_in_current_page(
        &self,
        state: &mut SorterState,
        required: usize,
    ) -> ShuffleResult<()> {
        let fits = state
            .pages
            .last()
            .is_some_and(|page| page.remaining() >= required);
        if fits {
            return Ok(());
        }
        if state.pages.len() >= MAXIMUM_PAGES {
            self.spill_locked(state)?;
        }
        let page_size = self.page_size.max(required);
        self.acquire_or_spill(state, page_size as u64)?;
        state.pages.push(Page {
            data: vec![0u8; page_size],
            len: 0,
        });
        Ok(())
    }

    fn acquire_or_spill(&self, state: &mut SorterState, bytes: u64) -> ShuffleResult<()> {
        let mut granted = self.memory.acquire_execution_memory(bytes);
        if granted < bytes {
            self.memory.release_execution_memory(granted);
            self.spill_locked(state)?;
            granted = self.memory.acquire_execution_memory(bytes);
            if granted < bytes {
                self.memory.release_execution_memory(granted);
                return Err(ShuffleError::MemoryExhausted(format!(
                    "unable to acquire {bytes} bytes of execution memory after spilling"
                )));
            }
        }
        state.allocated += bytes;
        if state.allocated > state.peak_allocated {
            state.peak_allocated = state.allocated;
        }
        Ok(())
    }

    /// Writes the in-memory records, ordered by partition, to a new spill
    /// file. Each partition segment is wrapped in encryption and the
    /// configured codec, so a fast merge can concatenate segments verbatim.
    fn write_sorted_file(&self, state: &mut SorterState, is_final: bool) -> ShuffleResult<()> {
        state.pointers.sort_unstable();

        let spill_file = tempfile::Builder::new()
            .prefix("shuffle-spill-")
            .suffix(".tmp")
            .tempfile_in(&self.spill_dir)?;
        let (file, path) = spill_file.keep().map_err(|e| e.error)?;

        let block_id = BlockId::TempShuffleBlock {
            id: state.next_spill_id,
        };
        state.next_spill_id += 1;

        let temp_metrics = TaskWriteMetrics::default();
        let metrics_to_use: &dyn ShuffleWriteMetrics = if is_final {
            self.metrics.as_ref()
        } else {
            &temp_metrics
        };

        let result = self.write_segments(state, file, &block_id, metrics_to_use);
        let partition_lengths = match result {
            Ok(lengths) => lengths,
            Err(e) => {
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    log::error!(
                        "Error while deleting spill file {}: {remove_err}",
                        path.display()
                    );
                }
                return Err(e);
            }
        };

        let file_length: u64 = partition_lengths.iter().sum();
        metrics_to_use.inc_bytes_written(file_length);
        metrics_to_use.inc_records_written(state.pointers.len() as u64);
        if !is_final {
            self.metrics
                .inc_records_written(temp_metrics.records_written());
            state.spill_count += 1;
            state.spilled_bytes += file_length;
        }

        state.spills.push(SpillInfo {
            file: path,
            partition_lengths,
            block_id,
        });

        for page in state.pages.drain(..) {
            let bytes = page.data.len() as u64;
            self.memory.release_execution_memory(bytes);
            state.allocated = state.allocated.saturating_sub(bytes);
        }
        state.pointers.clear();
        Ok(())
    }

    fn write_segments(
        &self,
        state: &SorterState,
        file: File,
        block_id: &BlockId,
        metrics: &dyn ShuffleWriteMetrics,
    ) -> ShuffleResult<Vec<u64>> {
        let mut counting =
            CountingWriter::new(BufWriter::with_capacity(self.file_buffer_size, file));
        let mut partition_lengths = vec![0u64; self.num_partitions as usize];

        let pointers = &state.pointers;
        let mut i = 0;
        while i < pointers.len() {
            let partition_id = partition_of(pointers[i]);
            let segment_start = counting.count();
            {
                let tracked = TimeTrackingWriter::new(&mut counting, metrics);
                let encrypted = self
                    .serializer_manager
                    .wrap_for_encryption(block_id, Box::new(tracked));
                let mut out = self.codec.compressed_output(encrypted)?;
                while i < pointers.len() && partition_of(pointers[i]) == partition_id {
                    let page = &state.pages[page_of(pointers[i])];
                    let offset = offset_of(pointers[i]);
                    let mut length_bytes = [0u8; RECORD_LENGTH_PREFIX];
                    length_bytes
                        .copy_from_slice(&page.data[offset..offset + RECORD_LENGTH_PREFIX]);
                    let length = u32::from_le_bytes(length_bytes) as usize;
                    let record_start = offset + RECORD_LENGTH_PREFIX;
                    out.write_all(&page.data[record_start..record_start + length])?;
                    i += 1;
                }
                out.finish()?;
            }
            partition_lengths[partition_id as usize] = counting.count() - segment_start;
        }

        counting.flush()?;
        Ok(partition_lengths)
    }
}

impl Drop for ShuffleExternalSorter {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup_resources() {
            log::debug!("Failed to clean up sorter resources on drop: {e}");
        }
    }
}

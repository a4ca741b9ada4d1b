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

//! The serialized shuffle writer facade.
//!
//! Orchestrates one map task's output: serialize each record once, sort by
//! partition id in the external sorter, merge the spilled runs into the map
//! output writer and commit. On failure the map output is aborted and the
//! sorter's resources are released.

use std::sync::Arc;

use crate::config::ShuffleConfig;
use crate::errors::{ShuffleError, ShuffleResult};
use crate::memory::TaskMemoryManager;
use crate::shuffle::merge::SpillMerger;
use crate::shuffle::metrics::ShuffleWriteMetrics;
use crate::shuffle::output::ShuffleWriteSupport;
use crate::shuffle::partitioner::Partitioner;
use crate::shuffle::ser_buffer::SerializationBuffer;
use crate::shuffle::serializer::{SerializerManager, ShuffleSerializer};
use crate::shuffle::sorter::{ShuffleExternalSorter, SpillInfo, MAXIMUM_PARTITIONS};

/// The serialized-mode partition ceiling imposed by the packed pointer
/// layout.
pub const MAX_SHUFFLE_OUTPUT_PARTITIONS_FOR_SERIALIZED_MODE: u32 = MAXIMUM_PARTITIONS;

/// Announces the committed map output: one byte length per partition,
/// enough for reducers to plan their fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapStatus {
    pub map_id: u32,
    pub partition_lengths: Vec<u64>,
}

impl MapStatus {
    pub fn new(map_id: u32, partition_lengths: Vec<u64>) -> Self {
        Self {
            map_id,
            partition_lengths,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.partition_lengths.iter().sum()
    }
}

/// Writes one map task's record stream as a sorted, partitioned on-disk
/// artifact.
pub struct SerializedShuffleWriter<K, V> {
    shuffle_id: u32,
    map_id: u32,
    partitioner: Arc<dyn Partitioner<K>>,
    serializer: Arc<dyn ShuffleSerializer<K, V>>,
    serializer_manager: Arc<dyn SerializerManager>,
    write_support: Arc<dyn ShuffleWriteSupport>,
    metrics: Arc<dyn ShuffleWriteMetrics>,
    config: ShuffleConfig,
    sorter: Option<ShuffleExternalSorter>,
    ser_buffer: Option<SerializationBuffer>,
    map_status: Option<MapStatus>,
    peak_memory_used: u64,
    stopping: bool,
}

impl<K, V> SerializedShuffleWriter<K, V> {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        shuffle_id: u32,
        map_id: u32,
        partitioner: Arc<dyn Partitioner<K>>,
        serializer: Arc<dyn ShuffleSerializer<K, V>>,
        serializer_manager: Arc<dyn SerializerManager>,
        memory: Arc<dyn TaskMemoryManager>,
        write_support: Arc<dyn ShuffleWriteSupport>,
        metrics: Arc<dyn ShuffleWriteMetrics>,
        config: ShuffleConfig,
    ) -> ShuffleResult<Self> {
        let num_partitions = partitioner.num_partitions();
        if num_partitions > MAX_SHUFFLE_OUTPUT_PARTITIONS_FOR_SERIALIZED_MODE {
            return Err(ShuffleError::Config(format!(
                "SerializedShuffleWriter can only be used for shuffles with at most {} \
                 reduce partitions, got {}",
                MAX_SHUFFLE_OUTPUT_PARTITIONS_FOR_SERIALIZED_MODE, num_partitions
            )));
        }

        let sorter = ShuffleExternalSorter::try_new(
            memory,
            Arc::clone(&serializer_manager),
            Arc::clone(&metrics),
            num_partitions,
            &config,
        )?;
        let ser_buffer = SerializationBuffer::with_capacity(config.ser_buffer_size);

        Ok(Self {
            shuffle_id,
            map_id,
            partitioner,
            serializer,
            serializer_manager,
            write_support,
            metrics,
            config,
            sorter: Some(sorter),
            ser_buffer: Some(ser_buffer),
            map_status: None,
            peak_memory_used: 0,
            stopping: false,
        })
    }

    /// Consumes the task's record stream and produces the committed map
    /// output. On failure the sorter's resources are released before the
    /// original error is surfaced.
    pub fn write<I>(&mut self, records: I) -> ShuffleResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut success = false;
        let result = (|| {
            for (key, value) in records {
                self.insert_record_into_sorter(&key, &value)?;
            }
            self.close_and_write_output()?;
            success = true;
            Ok(())
        })();
        if let Some(sorter) = &self.sorter {
            if let Err(cleanup_err) = sorter.cleanup_resources() {
                if success {
                    return Err(cleanup_err.into_cleanup());
                }
                log::error!(
                    "In addition to a failure during writing, we failed during cleanup: \
                     {cleanup_err}"
                );
            }
        }
        result
    }

    fn insert_record_into_sorter(&mut self, key: &K, value: &V) -> ShuffleResult<()> {
        let sorter = self.sorter.as_ref().ok_or_else(|| {
            ShuffleError::IllegalState("write called on a closed writer".to_string())
        })?;
        let ser_buffer = self.ser_buffer.as_mut().ok_or_else(|| {
            ShuffleError::IllegalState("write called on a closed writer".to_string())
        })?;

        let partition_id = self.partitioner.get_partition(key);
        ser_buffer.reset();
        self.serializer.write_key(key, ser_buffer)?;
        self.serializer.write_value(value, ser_buffer)?;

        let serialized_record_size = ser_buffer.len();
        if serialized_record_size == 0 {
            return Err(ShuffleError::Internal(
                "serializer produced an empty record".to_string(),
            ));
        }
        sorter.insert_record(ser_buffer.raw_view(), partition_id)
    }

    fn close_and_write_output(&mut self) -> ShuffleResult<()> {
        self.update_peak_memory_used();
        self.ser_buffer = None;
        let spills = match &self.sorter {
            Some(sorter) => sorter.close_and_get_spills()?,
            None => {
                return Err(ShuffleError::IllegalState(
                    "close_and_write_output called twice".to_string(),
                ))
            }
        };
        self.sorter = None;

        let num_partitions = self.partitioner.num_partitions();
        let mut map_writer = self.write_support.create_map_output_writer(
            self.shuffle_id,
            self.map_id,
            num_partitions,
        )?;

        let merger = SpillMerger {
            config: &self.config,
            serializer_manager: self.serializer_manager.as_ref(),
            metrics: self.metrics.as_ref(),
            shuffle_id: self.shuffle_id,
            map_id: self.map_id,
            num_partitions,
        };

        let result = (|| {
            let partition_lengths = {
                let merge_result = merger.merge_spills(&spills, map_writer.as_mut());
                delete_spills(&spills);
                merge_result?
            };
            map_writer.commit_all_partitions()?;
            Ok(partition_lengths)
        })();

        match result {
            Ok(partition_lengths) => {
                self.map_status = Some(MapStatus::new(self.map_id, partition_lengths));
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = map_writer.abort(&e) {
                    log::error!("Failed to abort the map output writer: {abort_err}");
                }
                Err(e)
            }
        }
    }

    /// Idempotent shutdown. With `success` the map status from `write` is
    /// returned; asking for a successful stop before `write` completed is
    /// an error.
    pub fn stop(&mut self, success: bool) -> ShuffleResult<Option<MapStatus>> {
        if !self.stopping {
            self.stopping = true;
            self.update_peak_memory_used();
            self.metrics.inc_peak_memory_used(self.peak_memory_used);
        }

        let result = if success {
            match &self.map_status {
                Some(status) => Ok(Some(status.clone())),
                None => Err(ShuffleError::IllegalState(
                    "cannot call stop(true) without having called write()".to_string(),
                )),
            }
        } else {
            Ok(None)
        };

        if let Some(sorter) = self.sorter.take() {
            // stop() in response to an error: release memory and spill files
            if let Err(e) = sorter.cleanup_resources() {
                log::error!("Failed to clean up the sorter while stopping: {e}");
            }
        }
        result
    }

    /// Peak memory used by this writer so far, in bytes.
    pub fn peak_memory_used_bytes(&mut self) -> u64 {
        self.update_peak_memory_used();
        self.peak_memory_used
    }

    fn update_peak_memory_used(&mut self) {
        if let Some(sorter) = &self.sorter {
            let mem = sorter.peak_memory_used();
            if mem > self.peak_memory_used {
                self.peak_memory_used = mem;
            }
        }
    }

    #[cfg(test)]
    fn force_sorter_to_spill(&self) -> ShuffleResult<()> {
        match &self.sorter {
            Some(sorter) => sorter.spill(),
            None => Err(ShuffleError::IllegalState("sorter is closed".to_string())),
        }
    }
}

fn delete_spills(spills: &[SpillInfo]) {
    for spill in spills {
        if spill.file.exists() {
            if let Err(e) = std::fs::remove_file(&spill.file) {
                log::error!(
                    "Error while deleting spill file {}: {e}",
                    spill.file.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::{BoundedMemoryManager, UnboundedMemoryManager};
    use crate::shuffle::codec::CompressionCodec;
    use crate::shuffle::metrics::TaskWriteMetrics;
    use crate::shuffle::output::LocalDiskShuffleWriteSupport;
    use crate::shuffle::serializer::{BlockId, DefaultSerializerManager};
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    /// Key: `u32 LE length + utf8 bytes`. Value: `i32 LE`.
    struct TestSerializer {
        fail_after: Option<u64>,
        written: AtomicU64,
    }

    impl TestSerializer {
        fn new() -> Self {
            Self {
                fail_after: None,
                written: AtomicU64::new(0),
            }
        }

        fn failing_after(records: u64) -> Self {
            Self {
                fail_after: Some(records),
                written: AtomicU64::new(0),
            }
        }
    }

    impl ShuffleSerializer<String, i32> for TestSerializer {
        fn write_key(&self, key: &String, out: &mut dyn Write) -> ShuffleResult<()> {
            if let Some(limit) = self.fail_after {
                if self.written.fetch_add(1, Ordering::SeqCst) >= limit {
                    return Err(ShuffleError::Internal("record source failed".to_string()));
                }
            }
            out.write_all(&(key.len() as u32).to_le_bytes())?;
            out.write_all(key.as_bytes())?;
            Ok(())
        }

        fn write_value(&self, value: &i32, out: &mut dyn Write) -> ShuffleResult<()> {
            out.write_all(&value.to_le_bytes())?;
            Ok(())
        }
    }

    fn decode_records(mut bytes: &[u8]) -> Vec<(String, i32)> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let mut len_bytes = [0u8; 4];
            bytes.read_exact(&mut len_bytes).unwrap();
            let mut key = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
            bytes.read_exact(&mut key).unwrap();
            let mut value_bytes = [0u8; 4];
            bytes.read_exact(&mut value_bytes).unwrap();
            records.push((
                String::from_utf8(key).unwrap(),
                i32::from_le_bytes(value_bytes),
            ));
        }
        records
    }

    /// Routes each key through an explicit table, so tests control
    /// placement exactly.
    struct TablePartitioner {
        table: HashMap<String, u32>,
        num_partitions: u32,
    }

    impl Partitioner<String> for TablePartitioner {
        fn num_partitions(&self) -> u32 {
            self.num_partitions
        }

        fn get_partition(&self, key: &String) -> u32 {
            self.table[key]
        }
    }

    fn abc_partitioner() -> Arc<TablePartitioner> {
        Arc::new(TablePartitioner {
            table: HashMap::from([
                ("a".to_string(), 0),
                ("b".to_string(), 1),
                ("c".to_string(), 0),
            ]),
            num_partitions: 2,
        })
    }

    fn abc_records() -> Vec<(String, i32)> {
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3),
        ]
    }

    /// XOR stream cipher standing in for a real encrypting manager; the
    /// transform is its own inverse.
    struct XorSerializerManager;

    const XOR_KEY: u8 = 0x5a;

    struct XorWriter<'a>(Box<dyn Write + 'a>);

    impl Write for XorWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let transformed: Vec<u8> = buf.iter().map(|b| b ^ XOR_KEY).collect();
            self.0.write_all(&transformed)?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.0.flush()
        }
    }

    struct XorReader<'a>(Box<dyn Read + 'a>);

    impl Read for XorReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.0.read(buf)?;
            for b in &mut buf[..n] {
                *b ^= XOR_KEY;
            }
            Ok(n)
        }
    }

    impl SerializerManager for XorSerializerManager {
        fn encryption_enabled(&self) -> bool {
            true
        }

        fn wrap_for_encryption<'a>(
            &self,
            _block_id: &BlockId,
            stream: Box<dyn Write + 'a>,
        ) -> Box<dyn Write + 'a> {
            Box::new(XorWriter(stream))
        }

        fn wrap_for_decryption<'a>(
            &self,
            _block_id: &BlockId,
            stream: Box<dyn Read + 'a>,
        ) -> Box<dyn Read + 'a> {
            Box::new(XorReader(stream))
        }
    }

    struct Harness {
        _dir: TempDir,
        support: Arc<LocalDiskShuffleWriteSupport>,
        metrics: Arc<TaskWriteMetrics>,
        memory: Arc<BoundedMemoryManager>,
        spill_dir: std::path::PathBuf,
        writer: SerializedShuffleWriter<String, i32>,
    }

    fn harness_with(
        config_overrides: impl FnOnce(&mut ShuffleConfig),
        serializer: TestSerializer,
        serializer_manager: Arc<dyn SerializerManager>,
        partitioner: Arc<dyn Partitioner<String>>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let spill_dir = dir.path().join("spill");
        let output_dir = dir.path().join("output");
        let mut config = ShuffleConfig {
            compress: false,
            spill_dir: spill_dir.clone(),
            ..Default::default()
        };
        config_overrides(&mut config);

        let support = Arc::new(LocalDiskShuffleWriteSupport::new(&output_dir));
        let metrics = Arc::new(TaskWriteMetrics::default());
        let memory = Arc::new(BoundedMemoryManager::new(64 * 1024 * 1024));
        let writer = SerializedShuffleWriter::try_new(
            0,
            0,
            partitioner,
            Arc::new(serializer),
            serializer_manager,
            Arc::clone(&memory) as Arc<dyn TaskMemoryManager>,
            Arc::clone(&support) as Arc<dyn ShuffleWriteSupport>,
            Arc::clone(&metrics) as Arc<dyn ShuffleWriteMetrics>,
            config,
        )
        .unwrap();
        Harness {
            _dir: dir,
            support,
            metrics,
            memory,
            spill_dir,
            writer,
        }
    }

    fn harness(config_overrides: impl FnOnce(&mut ShuffleConfig)) -> Harness {
        harness_with(
            config_overrides,
            TestSerializer::new(),
            Arc::new(DefaultSerializerManager),
            abc_partitioner(),
        )
    }

    fn read_partitions(harness: &Harness) -> Vec<Vec<u8>> {
        read_partitions_of(
            &harness.support.data_file(0, 0),
            &harness.support.index_file(0, 0),
        )
    }

    fn read_partitions_of(data_path: &Path, index_path: &Path) -> Vec<Vec<u8>> {
        let data = std::fs::read(data_path).unwrap();
        let index = std::fs::read(index_path).unwrap();
        let offsets: Vec<usize> = index
            .chunks_exact(8)
            .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()) as usize)
            .collect();
        offsets
            .windows(2)
            .map(|window| data[window[0]..window[1]].to_vec())
            .collect()
    }

    fn spill_dir_is_empty(harness: &Harness) -> bool {
        std::fs::read_dir(&harness.spill_dir)
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    }

    #[test]
    fn records_land_in_their_partitions_in_insertion_order() {
        let mut h = harness(|config| config.fast_merge_enabled = false);
        h.writer.write(abc_records()).unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();

        let partitions = read_partitions(&h);
        assert_eq!(partitions.len(), 2);
        assert_eq!(
            decode_records(&partitions[0]),
            vec![("a".to_string(), 1), ("c".to_string(), 3)]
        );
        assert_eq!(decode_records(&partitions[1]), vec![("b".to_string(), 2)]);

        assert_eq!(
            status.partition_lengths,
            vec![partitions[0].len() as u64, partitions[1].len() as u64]
        );
        assert_eq!(status.total_bytes(), h.metrics.bytes_written());
        assert_eq!(h.metrics.records_written(), 3);
        assert!(spill_dir_is_empty(&h));
    }

    #[test]
    fn forced_spills_match_the_no_spill_baseline() {
        let mut baseline = harness(|_| {});
        baseline.writer.write(abc_records()).unwrap();
        baseline.writer.stop(true).unwrap();
        let expected = read_partitions(&baseline);

        let mut h = harness(|_| {});
        for (key, value) in abc_records() {
            h.writer.insert_record_into_sorter(&key, &value).unwrap();
            h.writer.force_sorter_to_spill().unwrap();
        }
        h.writer.close_and_write_output().unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();

        // three forced spills plus the empty final drain force the
        // transferTo-based fast merge
        assert_eq!(read_partitions(&h), expected);
        assert_eq!(status.total_bytes(), h.metrics.bytes_written());
        assert_eq!(h.metrics.records_written(), 3);
        assert!(spill_dir_is_empty(&h));
    }

    #[test]
    fn stream_fast_merge_matches_transfer_to_byte_for_byte() {
        let run = |transfer_to: bool| {
            let mut h = harness(|config| config.transfer_to_enabled = transfer_to);
            for (i, (key, value)) in abc_records().into_iter().enumerate() {
                h.writer.insert_record_into_sorter(&key, &value).unwrap();
                if i < 2 {
                    h.writer.force_sorter_to_spill().unwrap();
                }
            }
            h.writer.close_and_write_output().unwrap();
            let status = h.writer.stop(true).unwrap().unwrap();
            assert_eq!(status.total_bytes(), h.metrics.bytes_written());
            (
                std::fs::read(h.support.data_file(0, 0)).unwrap(),
                std::fs::read(h.support.index_file(0, 0)).unwrap(),
            )
        };
        assert_eq!(run(true), run(false));
    }

    #[test]
    fn encryption_forces_the_stream_merge_and_round_trips() {
        let mut h = harness_with(
            |_| {},
            TestSerializer::new(),
            Arc::new(XorSerializerManager),
            abc_partitioner(),
        );
        for (i, (key, value)) in abc_records().into_iter().enumerate() {
            h.writer.insert_record_into_sorter(&key, &value).unwrap();
            if i < 2 {
                h.writer.force_sorter_to_spill().unwrap();
            }
        }
        h.writer.close_and_write_output().unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();
        assert_eq!(status.total_bytes(), h.metrics.bytes_written());

        let partitions = read_partitions(&h);
        let decrypt = |bytes: &[u8]| -> Vec<u8> { bytes.iter().map(|b| b ^ XOR_KEY).collect() };
        assert_eq!(
            decode_records(&decrypt(&partitions[0])),
            vec![("a".to_string(), 1), ("c".to_string(), 3)]
        );
        assert_eq!(
            decode_records(&decrypt(&partitions[1])),
            vec![("b".to_string(), 2)]
        );
    }

    #[test]
    fn non_concatenable_codec_uses_the_slow_merge() {
        let mut h = harness(|config| {
            config.compress = true;
            config.compression_codec = CompressionCodec::Deflate;
        });
        let records: Vec<(String, i32)> = (0..5)
            .flat_map(|round| {
                abc_records()
                    .into_iter()
                    .map(move |(key, value)| (key, value + round * 10))
            })
            .collect();
        for (i, (key, value)) in records.iter().enumerate() {
            h.writer.insert_record_into_sorter(key, value).unwrap();
            if i + 1 < records.len() {
                h.writer.force_sorter_to_spill().unwrap();
            }
        }
        h.writer.close_and_write_output().unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();
        assert_eq!(status.total_bytes(), h.metrics.bytes_written());

        // the slow merge re-encodes each partition as a single stream
        let partitions = read_partitions(&h);
        let codec = CompressionCodec::Deflate;
        let mut partition0 = Vec::new();
        codec
            .compressed_input(partitions[0].as_slice())
            .unwrap()
            .read_to_end(&mut partition0)
            .unwrap();
        let decoded = decode_records(&partition0);
        let expected: Vec<(String, i32)> = records
            .iter()
            .filter(|(key, _)| key != "b")
            .cloned()
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn compressed_fast_merge_round_trips() {
        let mut h = harness(|config| {
            config.compress = true;
            config.compression_codec = CompressionCodec::Zstd(1);
        });
        for (i, (key, value)) in abc_records().into_iter().enumerate() {
            h.writer.insert_record_into_sorter(&key, &value).unwrap();
            if i < 2 {
                h.writer.force_sorter_to_spill().unwrap();
            }
        }
        h.writer.close_and_write_output().unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();
        assert_eq!(status.total_bytes(), h.metrics.bytes_written());

        // each partition is a concatenation of zstd frames
        let partitions = read_partitions(&h);
        let codec = CompressionCodec::Zstd(1);
        let mut partition0 = Vec::new();
        codec
            .compressed_input(partitions[0].as_slice())
            .unwrap()
            .read_to_end(&mut partition0)
            .unwrap();
        assert_eq!(
            decode_records(&partition0),
            vec![("a".to_string(), 1), ("c".to_string(), 3)]
        );
    }

    #[test]
    fn zero_records_commit_zero_lengths() {
        let mut h = harness(|_| {});
        h.writer.write(Vec::new()).unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();
        assert_eq!(status.partition_lengths, vec![0, 0]);
        assert_eq!(h.metrics.bytes_written(), 0);
        assert_eq!(h.metrics.records_written(), 0);
        let partitions = read_partitions(&h);
        assert!(partitions.iter().all(|p| p.is_empty()));
    }

    #[test]
    fn one_record_takes_the_single_spill_path() {
        let mut h = harness(|_| {});
        h.writer.write(vec![("b".to_string(), 2)]).unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();
        assert_eq!(status.partition_lengths[0], 0);
        assert!(status.partition_lengths[1] > 0);
        assert_eq!(status.total_bytes(), h.metrics.bytes_written());
        let partitions = read_partitions(&h);
        assert_eq!(decode_records(&partitions[1]), vec![("b".to_string(), 2)]);
    }

    #[test]
    fn single_partition_takes_all_records() {
        let mut h = harness_with(
            |_| {},
            TestSerializer::new(),
            Arc::new(DefaultSerializerManager),
            Arc::new(TablePartitioner {
                table: HashMap::from([
                    ("a".to_string(), 0),
                    ("b".to_string(), 0),
                    ("c".to_string(), 0),
                ]),
                num_partitions: 1,
            }),
        );
        h.writer.write(abc_records()).unwrap();
        let status = h.writer.stop(true).unwrap().unwrap();
        assert_eq!(status.partition_lengths.len(), 1);
        let partitions = read_partitions(&h);
        assert_eq!(decode_records(&partitions[0]).len(), 3);
    }

    #[test]
    fn failing_record_source_releases_resources() {
        let mut h = harness_with(
            |_| {},
            TestSerializer::failing_after(100),
            Arc::new(DefaultSerializerManager),
            Arc::new(TablePartitioner {
                table: (0..200)
                    .map(|i| (format!("key{i}"), (i % 2) as u32))
                    .collect(),
                num_partitions: 2,
            }),
        );
        let records: Vec<(String, i32)> = (0..200).map(|i| (format!("key{i}"), i)).collect();
        let result = h.writer.write(records);
        assert!(matches!(result, Err(ShuffleError::Internal(_))));

        assert_eq!(h.writer.stop(false).unwrap(), None);
        assert_eq!(h.memory.used(), 0);
        assert!(spill_dir_is_empty(&h));
        assert!(matches!(
            h.writer.stop(true),
            Err(ShuffleError::IllegalState(_))
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = harness(|_| {});
        h.writer.write(abc_records()).unwrap();
        let first = h.writer.stop(true).unwrap();
        let second = h.writer.stop(true).unwrap();
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn stop_true_before_write_is_illegal() {
        let mut h = harness(|_| {});
        assert!(matches!(
            h.writer.stop(true),
            Err(ShuffleError::IllegalState(_))
        ));
    }

    #[test]
    fn partition_ceiling_is_enforced() {
        struct WidePartitioner {
            num_partitions: u32,
        }
        impl Partitioner<String> for WidePartitioner {
            fn num_partitions(&self) -> u32 {
                self.num_partitions
            }
            fn get_partition(&self, _key: &String) -> u32 {
                0
            }
        }

        let dir = TempDir::new().unwrap();
        let build = |num_partitions: u32| {
            SerializedShuffleWriter::<String, i32>::try_new(
                0,
                0,
                Arc::new(WidePartitioner { num_partitions }),
                Arc::new(TestSerializer::new()),
                Arc::new(DefaultSerializerManager),
                Arc::new(UnboundedMemoryManager),
                Arc::new(LocalDiskShuffleWriteSupport::new(dir.path())),
                Arc::new(TaskWriteMetrics::default()),
                ShuffleConfig {
                    spill_dir: dir.path().join("spill"),
                    ..Default::default()
                },
            )
        };
        assert!(build(MAX_SHUFFLE_OUTPUT_PARTITIONS_FOR_SERIALIZED_MODE).is_ok());
        assert!(matches!(
            build(MAX_SHUFFLE_OUTPUT_PARTITIONS_FOR_SERIALIZED_MODE + 1),
            Err(ShuffleError::Config(_))
        ));
    }

    #[test]
    fn memory_pressure_spills_and_still_round_trips() {
        use rand::Rng;

        let mut table = HashMap::new();
        let mut records = Vec::new();
        let mut rng = rand::thread_rng();
        for i in 0..12_000u32 {
            let key = format!("key-{i:05}");
            table.insert(key.clone(), i % 4);
            records.push((key, rng.gen::<i32>()));
        }

        let dir = TempDir::new().unwrap();
        let spill_dir = dir.path().join("spill");
        let support = Arc::new(LocalDiskShuffleWriteSupport::new(dir.path().join("out")));
        let metrics = Arc::new(TaskWriteMetrics::default());
        let memory = Arc::new(BoundedMemoryManager::new(256 * 1024));
        let mut writer = SerializedShuffleWriter::try_new(
            0,
            0,
            Arc::new(TablePartitioner {
                table,
                num_partitions: 4,
            }),
            Arc::new(TestSerializer::new()),
            Arc::new(DefaultSerializerManager),
            Arc::clone(&memory) as Arc<dyn TaskMemoryManager>,
            Arc::clone(&support) as Arc<dyn ShuffleWriteSupport>,
            Arc::clone(&metrics) as Arc<dyn ShuffleWriteMetrics>,
            ShuffleConfig {
                compress: false,
                page_size: 16 * 1024,
                spill_dir: spill_dir.clone(),
                ..Default::default()
            },
        )
        .unwrap();

        writer.write(records.clone()).unwrap();
        let status = writer.stop(true).unwrap().unwrap();
        assert!(writer.peak_memory_used_bytes() <= 256 * 1024);
        assert_eq!(status.total_bytes(), metrics.bytes_written());
        assert_eq!(metrics.records_written(), records.len() as u64);
        assert_eq!(memory.used(), 0);

        let partitions =
            read_partitions_of(&support.data_file(0, 0), &support.index_file(0, 0));
        let mut decoded: Vec<(String, i32)> = partitions
            .iter()
            .flat_map(|bytes| decode_records(bytes))
            .collect();
        decoded.sort();
        let mut expected = records;
        expected.sort();
        assert_eq!(decoded, expected);
    }
}

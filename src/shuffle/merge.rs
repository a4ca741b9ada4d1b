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

//! Merges spilled sorted runs into the final map output.
//!
//! Strategy selection depends on how much the spilled bytes may be
//! reinterpreted: concatenable codec frames can be gluing-copied (with the
//! kernel copy path when no re-encryption is needed), anything else must be
//! decoded and re-encoded per partition.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::time::Instant;

use crate::config::ShuffleConfig;
use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::codec::CompressionCodec;
use crate::shuffle::io::{FlushShieldWriter, TimeTrackingWriter};
use crate::shuffle::metrics::ShuffleWriteMetrics;
use crate::shuffle::output::{ShuffleMapOutputWriter, ShufflePartitionWriter};
use crate::shuffle::serializer::{BlockId, SerializerManager};
use crate::shuffle::sorter::SpillInfo;

#[derive(Debug)]
enum MergeStrategy {
    /// Concatenate partition segments with the kernel copy path.
    TransferTo,
    /// Concatenate (codec `None`) or decode-and-re-encode (codec `Some`)
    /// partition segments through buffered streams.
    FileStream { codec: Option<CompressionCodec> },
}

pub(crate) struct SpillMerger<'a> {
    pub config: &'a ShuffleConfig,
    pub serializer_manager: &'a dyn SerializerManager,
    pub metrics: &'a dyn ShuffleWriteMetrics,
    pub shuffle_id: u32,
    pub map_id: u32,
    pub num_partitions: u32,
}

impl SpillMerger<'_> {
    /// Merges zero or more spill files, choosing the fastest strategy the
    /// configuration and codec permit, and returns the partition lengths of
    /// the merged output.
    pub fn merge_spills(
        &self,
        spills: &[SpillInfo],
        map_writer: &mut dyn ShuffleMapOutputWriter,
    ) -> ShuffleResult<Vec<u64>> {
        if spills.is_empty() {
            return Ok(vec![0; self.num_partitions as usize]);
        }
        if spills.len() == 1 {
            // the bytes in a lone spill were already counted as shuffle
            // bytes written when the sorter drained
            return self.merge_single_spill(&spills[0], map_writer);
        }

        let partition_lengths = match self.select_strategy() {
            MergeStrategy::TransferTo => {
                log::debug!("Using transferTo-based fast merge");
                self.merge_spills_with_transfer_to(spills, map_writer)?
            }
            MergeStrategy::FileStream { codec } => {
                match &codec {
                    Some(_) => log::debug!("Using slow merge"),
                    None => log::debug!("Using fileStream-based fast merge"),
                }
                self.merge_spills_with_file_stream(spills, map_writer, codec.as_ref())?
            }
        };

        // The sorter's final drain was counted as shuffle write when it was
        // written, and the merge just counted it again while streaming it
        // through.
        let last_spill_length = std::fs::metadata(&spills[spills.len() - 1].file)?.len();
        self.metrics.dec_bytes_written(last_spill_length);

        Ok(partition_lengths)
    }

    fn select_strategy(&self) -> MergeStrategy {
        let codec = self.config.effective_codec();
        let fast_merge_is_supported = codec.supports_concatenation_of_serialized_streams();
        let encryption_enabled = self.serializer_manager.encryption_enabled();
        if self.config.fast_merge_enabled && fast_merge_is_supported {
            if self.config.transfer_to_enabled && !encryption_enabled {
                MergeStrategy::TransferTo
            } else {
                MergeStrategy::FileStream { codec: None }
            }
        } else {
            MergeStrategy::FileStream { codec: Some(codec) }
        }
    }

    /// Copies each partition's bytes straight out of the only spill file.
    /// The spill input stays open across all partitions and is closed once
    /// at the end.
    fn merge_single_spill(
        &self,
        spill: &SpillInfo,
        map_writer: &mut dyn ShuffleMapOutputWriter,
    ) -> ShuffleResult<Vec<u64>> {
        let num_partitions = self.num_partitions as usize;
        let mut partition_lengths = vec![0u64; num_partitions];
        let mut file = File::open(&spill.file)?;

        for partition in 0..num_partitions {
            let mut writer = map_writer.next_partition_writer()?;
            let expected = spill.partition_lengths[partition];
            let copy_result: ShuffleResult<()> = (|| {
                if expected == 0 {
                    return Ok(());
                }
                let mut transferred = None;
                if self.config.transfer_to_enabled {
                    if let Some(mut channel) = writer.channel()? {
                        transferred = Some(channel.transfer_from(&mut file, expected)?);
                    }
                }
                let copied = match transferred {
                    Some(copied) => copied,
                    None => copy_from_file(&mut file, writer.stream()?, expected)?,
                };
                if copied != expected {
                    return Err(ShuffleError::Internal(format!(
                        "expected to copy {expected} bytes from spill but copied {copied}"
                    )));
                }
                Ok(())
            })();
            partition_lengths[partition] = close_partition_writer(writer.as_mut(), copy_result)?;
        }
        Ok(partition_lengths)
    }

    /// Concatenates each partition's segments across all spills using the
    /// kernel copy path between file descriptors.
    fn merge_spills_with_transfer_to(
        &self,
        spills: &[SpillInfo],
        map_writer: &mut dyn ShuffleMapOutputWriter,
    ) -> ShuffleResult<Vec<u64>> {
        debug_assert!(spills.len() >= 2);
        let num_partitions = self.num_partitions as usize;
        let mut partition_lengths = vec![0u64; num_partitions];
        let mut spill_channels = Vec::with_capacity(spills.len());
        for spill in spills {
            spill_channels.push(File::open(&spill.file)?);
        }
        let mut spill_positions = vec![0u64; spills.len()];

        for partition in 0..num_partitions {
            let mut writer = map_writer.next_partition_writer()?;
            let mut transferred = 0u64;
            let copy_result: ShuffleResult<()> = (|| {
                let Some(mut channel) = writer.channel()? else {
                    return Err(ShuffleError::Internal(
                        "partition writer does not expose a transfer channel".to_string(),
                    ));
                };
                for (i, spill) in spills.iter().enumerate() {
                    let length = spill.partition_lengths[partition];
                    if length > 0 {
                        let write_start = Instant::now();
                        let copied = channel.transfer_from(&mut spill_channels[i], length)?;
                        self.metrics
                            .inc_write_time(write_start.elapsed().as_nanos() as u64);
                        if copied != length {
                            return Err(ShuffleError::Internal(format!(
                                "expected to transfer {length} bytes from spill {i} but moved {copied}"
                            )));
                        }
                        spill_positions[i] += length;
                        transferred += length;
                    }
                }
                Ok(())
            })();
            let num_bytes = close_partition_writer(writer.as_mut(), copy_result)?;
            if num_bytes != transferred {
                return Err(ShuffleError::Internal(format!(
                    "partition writer reported {num_bytes} bytes but {transferred} were transferred"
                )));
            }
            partition_lengths[partition] = num_bytes;
            self.metrics.inc_bytes_written(num_bytes);
        }

        for (i, channel) in spill_channels.iter_mut().enumerate() {
            let position = channel.stream_position()?;
            let file_length = std::fs::metadata(&spills[i].file)?.len();
            if position != file_length {
                return Err(ShuffleError::Internal(format!(
                    "spill {i} was left at position {position} of {file_length} after the merge"
                )));
            }
        }
        Ok(partition_lengths)
    }

    /// Streams each partition's segments across all spills through buffered
    /// readers into a wrapped partition stream. With a codec this is the
    /// slow merge: every segment is decrypted and decoded, and the whole
    /// partition re-encoded as one stream.
    fn merge_spills_with_file_stream(
        &self,
        spills: &[SpillInfo],
        map_writer: &mut dyn ShuffleMapOutputWriter,
        codec: Option<&CompressionCodec>,
    ) -> ShuffleResult<Vec<u64>> {
        debug_assert!(spills.len() >= 2);
        let num_partitions = self.num_partitions as usize;
        let mut partition_lengths = vec![0u64; num_partitions];
        let mut spill_inputs = Vec::with_capacity(spills.len());
        for spill in spills {
            spill_inputs.push(BufReader::with_capacity(
                self.config.file_buffer_size,
                File::open(&spill.file)?,
            ));
        }

        for partition in 0..num_partitions {
            let output_block = BlockId::ShuffleBlock {
                shuffle_id: self.shuffle_id,
                map_id: self.map_id,
                reduce_id: partition as u32,
            };
            let mut writer = map_writer.next_partition_writer()?;
            let copy_result: ShuffleResult<()> = (|| {
                let raw = writer.stream()?;
                let shielded = FlushShieldWriter::new(raw);
                let buffered = BufWriter::with_capacity(self.config.output_buffer_size, shielded);
                let tracked = TimeTrackingWriter::new(buffered, self.metrics);
                let encrypted = self
                    .serializer_manager
                    .wrap_for_encryption(&output_block, Box::new(tracked));
                let mut partition_output = match codec {
                    Some(codec) => codec.compressed_output(encrypted)?,
                    None => CompressionCodec::None.compressed_output(encrypted)?,
                };

                for (i, spill) in spills.iter().enumerate() {
                    let length = spill.partition_lengths[partition];
                    if length == 0 {
                        continue;
                    }
                    let mut limited = (&mut spill_inputs[i]).take(length);
                    {
                        let decrypted = self
                            .serializer_manager
                            .wrap_for_decryption(&spill.block_id, Box::new(&mut limited));
                        match codec {
                            Some(codec) => {
                                let mut decoded = codec.compressed_input(decrypted)?;
                                io::copy(&mut decoded, &mut partition_output)?;
                            }
                            None => {
                                let mut decrypted = decrypted;
                                io::copy(&mut decrypted, &mut partition_output)?;
                            }
                        }
                    }
                    // a decoder may stop at its logical end without
                    // consuming the trailing segment bytes
                    io::copy(&mut limited, &mut io::sink())?;
                }

                let mut inner = partition_output.finish()?;
                inner.flush()?;
                Ok(())
            })();
            let num_bytes = close_partition_writer(writer.as_mut(), copy_result)?;
            partition_lengths[partition] = num_bytes;
            self.metrics.inc_bytes_written(num_bytes);
        }
        Ok(partition_lengths)
    }
}

fn copy_from_file(file: &mut File, out: &mut dyn Write, length: u64) -> ShuffleResult<u64> {
    let mut limited = (&mut *file).take(length);
    Ok(io::copy(&mut limited, out)?)
}

/// Closes the partition writer, suppressing (but logging) close failures
/// when the copy already failed so the root cause is preserved, and returns
/// the writer's byte count on success.
fn close_partition_writer(
    writer: &mut dyn ShufflePartitionWriter,
    copy_result: ShuffleResult<()>,
) -> ShuffleResult<u64> {
    let close_result = writer.close();
    match copy_result {
        Err(copy_err) => {
            if let Err(close_err) = close_result {
                log::error!("Failed to close partition writer after a copy failure: {close_err}");
            }
            Err(copy_err)
        }
        Ok(()) => {
            close_result?;
            Ok(writer.num_bytes_written())
        }
    }
}

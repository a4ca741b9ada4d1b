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

//! Writes `(key, value)` pairs into a single partition's sink, for shuffle
//! paths that bypass the serialized sorter.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::codec::{CompressedWriter, CompressionCodec};
use crate::shuffle::io::SharedCountingWriter;
use crate::shuffle::metrics::ShuffleWriteMetrics;
use crate::shuffle::serializer::{BlockId, SerializerManager, ShuffleSerializer};

/// How many records may pass between refreshes of the bytes-written metric.
const RECORDS_BETWEEN_BYTES_WRITTEN_UPDATES: u64 = 16384;

/// Serializes pairs into one partition's sink through the encryption and
/// compression chain. The chain is opened lazily on the first record so an
/// empty partition never touches its sink, and closed LIFO with every step
/// guarded so later steps run even when an earlier one fails.
pub struct ShufflePartitionPairsWriter<'a, K, V> {
    sink: Option<&'a mut dyn Write>,
    serializer: &'a dyn ShuffleSerializer<K, V>,
    serializer_manager: &'a dyn SerializerManager,
    codec: CompressionCodec,
    block_id: BlockId,
    metrics: &'a dyn ShuffleWriteMetrics,
    chain: Option<CompressedWriter<Box<dyn Write + 'a>>>,
    bytes_to_sink: Arc<AtomicU64>,
    bytes_reported: u64,
    records_written: u64,
    closed: bool,
}

impl<'a, K, V> ShufflePartitionPairsWriter<'a, K, V> {
    pub fn new(
        sink: &'a mut dyn Write,
        serializer: &'a dyn ShuffleSerializer<K, V>,
        serializer_manager: &'a dyn SerializerManager,
        codec: CompressionCodec,
        block_id: BlockId,
        metrics: &'a dyn ShuffleWriteMetrics,
    ) -> Self {
        Self {
            sink: Some(sink),
            serializer,
            serializer_manager,
            codec,
            block_id,
            metrics,
            chain: None,
            bytes_to_sink: Arc::new(AtomicU64::new(0)),
            bytes_reported: 0,
            records_written: 0,
            closed: false,
        }
    }

    pub fn write(&mut self, key: &K, value: &V) -> ShuffleResult<()> {
        if self.closed {
            return Err(ShuffleError::IllegalState(
                "write called on a closed pairs writer".to_string(),
            ));
        }
        if self.chain.is_none() {
            self.open()?;
        }
        let chain = match self.chain.as_mut() {
            Some(chain) => chain,
            None => {
                return Err(ShuffleError::IllegalState(
                    "pairs writer chain failed to open".to_string(),
                ))
            }
        };
        self.serializer.write_key(key, chain)?;
        self.serializer.write_value(value, chain)?;
        self.records_written += 1;
        self.metrics.inc_records_written(1);
        if self.records_written % RECORDS_BETWEEN_BYTES_WRITTEN_UPDATES == 0 {
            self.update_bytes_written();
        }
        Ok(())
    }

    fn open(&mut self) -> ShuffleResult<()> {
        let sink = self.sink.take().ok_or_else(|| {
            ShuffleError::IllegalState("pairs writer sink already consumed".to_string())
        })?;
        let counting = SharedCountingWriter::new(sink, Arc::clone(&self.bytes_to_sink));
        let encrypted = self
            .serializer_manager
            .wrap_for_encryption(&self.block_id, Box::new(counting));
        self.chain = Some(self.codec.compressed_output(encrypted)?);
        Ok(())
    }

    /// Tears the chain down and refreshes the bytes-written metric one last
    /// time. Idempotent.
    pub fn close(&mut self) -> ShuffleResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error: Option<ShuffleError> = None;
        if let Some(chain) = self.chain.take() {
            match chain.finish() {
                Ok(mut encrypted) => {
                    if let Err(e) = encrypted.flush() {
                        first_error.get_or_insert(e.into());
                    }
                }
                Err(e) => {
                    first_error = Some(e);
                }
            }
        }
        self.sink = None;
        self.update_bytes_written();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn update_bytes_written(&mut self) {
        let current = self.bytes_to_sink.load(Ordering::Relaxed);
        let delta = current.saturating_sub(self.bytes_reported);
        if delta > 0 {
            self.metrics.inc_bytes_written(delta);
            self.bytes_reported = current;
        }
    }
}

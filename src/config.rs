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

//! Configuration for the serialized shuffle writer.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::CompressionCodec;

pub const SHUFFLE_COMPRESS: &str = "shuffle.compress";
pub const SHUFFLE_COMPRESSION_CODEC: &str = "shuffle.compression.codec";
pub const SHUFFLE_UNSAFE_FAST_MERGE_ENABLED: &str = "shuffle.unsafe.fast-merge.enabled";
/// Historical misspelling of [`SHUFFLE_UNSAFE_FAST_MERGE_ENABLED`], accepted as an alias.
pub const SHUFFLE_UNSAFE_FAST_MERGE_ENABLED_ALIAS: &str = "shuffle.undafe.fast-merge.enabled";
pub const SHUFFLE_FILE_TRANSFER_TO: &str = "shuffle.file.transferTo";
pub const SHUFFLE_SORT_INIT_BUFFER_SIZE: &str = "shuffle.sort.init-buffer-size";
pub const SHUFFLE_FILE_BUFFER_SIZE: &str = "shuffle.file.buffer-size";
pub const SHUFFLE_UNSAFE_FILE_OUTPUT_BUFFER_SIZE: &str = "shuffle.unsafe.file.output-buffer-size";
pub const SHUFFLE_SORT_INIT_SER_BUFFER_SIZE: &str = "shuffle.sort.init-ser-buffer-size";
pub const SHUFFLE_MEMORY_PAGE_SIZE: &str = "shuffle.memory.page-size";
pub const SHUFFLE_SPILL_DIR: &str = "shuffle.spill.dir";

/// Controls buffering, spilling, merging and compression for the shuffle
/// writer.
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Whether partition streams are wrapped in the configured codec (default: true)
    pub compress: bool,
    /// Compression codec for shuffle data (default: Lz4Frame)
    pub compression_codec: CompressionCodec,
    /// Whether to attempt a fast merge when conditions allow (default: true)
    pub fast_merge_enabled: bool,
    /// Whether to use the kernel copy path during merge where permitted (default: true)
    pub transfer_to_enabled: bool,
    /// Initial sort buffer capacity, in records (default: 4096)
    pub init_sort_buffer_size: usize,
    /// Input buffer size for stream merge, in bytes (default: 32 KiB)
    pub file_buffer_size: usize,
    /// Output buffer size for stream merge, in bytes (default: 32 KiB)
    pub output_buffer_size: usize,
    /// Initial serialization buffer capacity, in bytes (default: 1 MiB)
    pub ser_buffer_size: usize,
    /// Memory page size requested from the memory manager, in bytes (default: 4 MiB)
    pub page_size: usize,
    /// Directory for spill files (default: the system temp directory)
    pub spill_dir: PathBuf,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            compress: true,
            compression_codec: CompressionCodec::Lz4Frame,
            fast_merge_enabled: true,
            transfer_to_enabled: true,
            init_sort_buffer_size: 4096,
            file_buffer_size: 32 * 1024,
            output_buffer_size: 32 * 1024,
            ser_buffer_size: 1024 * 1024,
            page_size: 4 * 1024 * 1024,
            spill_dir: std::env::temp_dir(),
        }
    }
}

impl ShuffleConfig {
    /// Builds a configuration from string-keyed options. Unknown keys are
    /// ignored so callers can pass a full engine configuration through.
    pub fn from_options(options: &HashMap<String, String>) -> ShuffleResult<Self> {
        let mut config = ShuffleConfig::default();
        if let Some(v) = options.get(SHUFFLE_COMPRESS) {
            config.compress = parse_bool(SHUFFLE_COMPRESS, v)?;
        }
        if let Some(v) = options.get(SHUFFLE_COMPRESSION_CODEC) {
            config.compression_codec = CompressionCodec::from_name(v)?;
        }
        let fast_merge = options
            .get(SHUFFLE_UNSAFE_FAST_MERGE_ENABLED)
            .or_else(|| options.get(SHUFFLE_UNSAFE_FAST_MERGE_ENABLED_ALIAS));
        if let Some(v) = fast_merge {
            config.fast_merge_enabled = parse_bool(SHUFFLE_UNSAFE_FAST_MERGE_ENABLED, v)?;
        }
        if let Some(v) = options.get(SHUFFLE_FILE_TRANSFER_TO) {
            config.transfer_to_enabled = parse_bool(SHUFFLE_FILE_TRANSFER_TO, v)?;
        }
        if let Some(v) = options.get(SHUFFLE_SORT_INIT_BUFFER_SIZE) {
            config.init_sort_buffer_size = parse_size(SHUFFLE_SORT_INIT_BUFFER_SIZE, v)?;
        }
        if let Some(v) = options.get(SHUFFLE_FILE_BUFFER_SIZE) {
            config.file_buffer_size = parse_size(SHUFFLE_FILE_BUFFER_SIZE, v)? * 1024;
        }
        if let Some(v) = options.get(SHUFFLE_UNSAFE_FILE_OUTPUT_BUFFER_SIZE) {
            config.output_buffer_size =
                parse_size(SHUFFLE_UNSAFE_FILE_OUTPUT_BUFFER_SIZE, v)? * 1024;
        }
        if let Some(v) = options.get(SHUFFLE_SORT_INIT_SER_BUFFER_SIZE) {
            config.ser_buffer_size = parse_size(SHUFFLE_SORT_INIT_SER_BUFFER_SIZE, v)?;
        }
        if let Some(v) = options.get(SHUFFLE_MEMORY_PAGE_SIZE) {
            config.page_size = parse_size(SHUFFLE_MEMORY_PAGE_SIZE, v)?;
        }
        if let Some(v) = options.get(SHUFFLE_SPILL_DIR) {
            config.spill_dir = PathBuf::from(v);
        }
        Ok(config)
    }

    /// The codec actually applied to partition streams. Disabling
    /// compression degenerates to the trivially concatenable `None` codec.
    pub(crate) fn effective_codec(&self) -> CompressionCodec {
        if self.compress {
            self.compression_codec.clone()
        } else {
            CompressionCodec::None
        }
    }
}

fn parse_bool(key: &str, value: &str) -> ShuffleResult<bool> {
    value
        .parse::<bool>()
        .map_err(|_| ShuffleError::Config(format!("invalid boolean for {key}: {value}")))
}

fn parse_size(key: &str, value: &str) -> ShuffleResult<usize> {
    value
        .parse::<usize>()
        .map_err(|_| ShuffleError::Config(format!("invalid size for {key}: {value}")))
}

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

//! The serialized-mode map-side shuffle writer.
//!
//! A map task feeds its `(key, value)` stream through
//! [`SerializedShuffleWriter`], which serializes each record once, routes
//! it to its destination partition with an external sort keyed on partition
//! id only, spills sorted runs under memory pressure and merges all spills
//! into a single map output artifact with a per-partition index.

mod codec;
mod io;
mod merge;
mod metrics;
mod output;
mod pairs_writer;
mod partitioner;
mod ser_buffer;
mod serializer;
mod sorter;
mod writer;

pub use codec::{CompressedReader, CompressedWriter, CompressionCodec};
pub use io::{CountingWriter, FlushShieldWriter, SharedCountingWriter, TimeTrackingWriter};
pub use metrics::{ShuffleWriteMetrics, TaskWriteMetrics};
pub use output::{
    LocalDiskShuffleMapOutputWriter, LocalDiskShuffleWriteSupport, ShuffleMapOutputWriter,
    ShufflePartitionWriter, ShuffleWriteSupport, TransferChannel,
};
pub use pairs_writer::ShufflePartitionPairsWriter;
pub use partitioner::{HashPartitioner, Partitioner};
pub use ser_buffer::SerializationBuffer;
pub use serializer::{BlockId, DefaultSerializerManager, SerializerManager, ShuffleSerializer};
pub use sorter::{ShuffleExternalSorter, SpillInfo};
pub use writer::{
    MapStatus, SerializedShuffleWriter, MAX_SHUFFLE_OUTPUT_PARTITIONS_FOR_SERIALIZED_MODE,
};

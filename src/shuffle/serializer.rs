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

use std::fmt;
use std::io::{Read, Write};

use crate::errors::ShuffleResult;

/// Identifies the block a stream belongs to, so a serializer manager can
/// derive per-block encryption state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    /// One reduce partition of a map output.
    ShuffleBlock {
        shuffle_id: u32,
        map_id: u32,
        reduce_id: u32,
    },
    /// A spilled sorted run, private to one writer.
    TempShuffleBlock { id: u64 },
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::ShuffleBlock {
                shuffle_id,
                map_id,
                reduce_id,
            } => write!(f, "shuffle_{shuffle_id}_{map_id}_{reduce_id}"),
            BlockId::TempShuffleBlock { id } => write!(f, "temp_shuffle_{id}"),
        }
    }
}

/// Encodes keys and values of one record into an opaque byte stream. The
/// writer never interprets the produced bytes; downstream readers rely on
/// the serializer's own framing.
pub trait ShuffleSerializer<K, V>: Send + Sync {
    fn write_key(&self, key: &K, out: &mut dyn Write) -> ShuffleResult<()>;
    fn write_value(&self, value: &V, out: &mut dyn Write) -> ShuffleResult<()>;
}

/// Applies per-block encryption to streams. Compression is layered
/// separately by the codec so the merge can reason about the two concerns
/// independently.
pub trait SerializerManager: Send + Sync {
    fn encryption_enabled(&self) -> bool;

    fn wrap_for_encryption<'a>(
        &self,
        block_id: &BlockId,
        stream: Box<dyn Write + 'a>,
    ) -> Box<dyn Write + 'a>;

    fn wrap_for_decryption<'a>(
        &self,
        block_id: &BlockId,
        stream: Box<dyn Read + 'a>,
    ) -> Box<dyn Read + 'a>;
}

/// Pass-through manager for deployments without shuffle encryption.
#[derive(Debug, Default)]
pub struct DefaultSerializerManager;

impl SerializerManager for DefaultSerializerManager {
    fn encryption_enabled(&self) -> bool {
        false
    }

    fn wrap_for_encryption<'a>(
        &self,
        _block_id: &BlockId,
        stream: Box<dyn Write + 'a>,
    ) -> Box<dyn Write + 'a> {
        stream
    }

    fn wrap_for_decryption<'a>(
        &self,
        _block_id: &BlockId,
        stream: Box<dyn Read + 'a>,
    ) -> Box<dyn Read + 'a> {
        stream
    }
}

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

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maps a record key to its destination partition in `[0, num_partitions)`.
pub trait Partitioner<K>: Send + Sync {
    fn num_partitions(&self) -> u32;
    fn get_partition(&self, key: &K) -> u32;
}

/// Hash partitioner with positive-modulo bucketing.
#[derive(Debug, Clone)]
pub struct HashPartitioner {
    num_partitions: u32,
}

impl HashPartitioner {
    pub fn new(num_partitions: u32) -> Self {
        assert!(num_partitions > 0, "need at least one partition");
        Self { num_partitions }
    }
}

impl<K: Hash> Partitioner<K> for HashPartitioner {
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn get_partition(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        pmod(hasher.finish() as u32, self.num_partitions)
    }
}

fn pmod(hash: u32, n: u32) -> u32 {
    let hash = hash as i32;
    let n = n as i32;
    let r = hash % n;
    let result = if r < 0 { (r + n) % n } else { r };
    result as u32
}

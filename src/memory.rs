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

//! Execution memory accounting for the shuffle writer.
//!
//! The sorter asks the manager before every page or pointer-array
//! allocation and spills when the request cannot be granted in full.

use std::sync::atomic::{AtomicU64, Ordering};

/// Grants and reclaims execution memory for a single task attempt.
pub trait TaskMemoryManager: Send + Sync {
    /// Tries to acquire `bytes` of execution memory and returns the number
    /// of bytes actually granted, which may be anything from 0 to `bytes`.
    fn acquire_execution_memory(&self, bytes: u64) -> u64;

    /// Returns `bytes` of previously granted execution memory.
    fn release_execution_memory(&self, bytes: u64);
}

/// Grants every request. Useful when an outer scheduler already bounds
/// task memory.
#[derive(Debug, Default)]
pub struct UnboundedMemoryManager;

impl TaskMemoryManager for UnboundedMemoryManager {
    fn acquire_execution_memory(&self, bytes: u64) -> u64 {
        bytes
    }

    fn release_execution_memory(&self, _bytes: u64) {}
}

/// Grants requests against a fixed budget, handing out partial grants when
/// the budget is nearly exhausted.
#[derive(Debug)]
pub struct BoundedMemoryManager {
    limit: u64,
    used: AtomicU64,
}

impl BoundedMemoryManager {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl TaskMemoryManager for BoundedMemoryManager {
    fn acquire_execution_memory(&self, bytes: u64) -> u64 {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let granted = bytes.min(self.limit.saturating_sub(current));
            if granted == 0 {
                return 0;
            }
            match self.used.compare_exchange(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_execution_memory(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

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

use std::sync::atomic::{AtomicU64, Ordering};

/// Reporter for a task's shuffle write metrics.
///
/// `dec_bytes_written` exists because the sorter's final in-memory drain is
/// accounted as shuffle write rather than spill; when that file is then
/// merged together with other spills its length would be counted twice, and
/// the merge subtracts it back out.
pub trait ShuffleWriteMetrics: Send + Sync {
    fn inc_bytes_written(&self, bytes: u64);
    fn dec_bytes_written(&self, bytes: u64);
    fn inc_records_written(&self, records: u64);
    /// Shuffle write time, in nanoseconds.
    fn inc_write_time(&self, nanos: u64);
    fn inc_peak_memory_used(&self, bytes: u64);
}

/// Atomic counters backing [`ShuffleWriteMetrics`] for a single task.
#[derive(Debug, Default)]
pub struct TaskWriteMetrics {
    bytes_written: AtomicU64,
    records_written: AtomicU64,
    write_time_nanos: AtomicU64,
    peak_memory_used: AtomicU64,
}

impl TaskWriteMetrics {
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Acquire)
    }

    pub fn write_time_nanos(&self) -> u64 {
        self.write_time_nanos.load(Ordering::Acquire)
    }

    pub fn peak_memory_used(&self) -> u64 {
        self.peak_memory_used.load(Ordering::Acquire)
    }
}

impl ShuffleWriteMetrics for TaskWriteMetrics {
    fn inc_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    fn dec_bytes_written(&self, bytes: u64) {
        let mut current = self.bytes_written.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.bytes_written.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn inc_records_written(&self, records: u64) {
        self.records_written.fetch_add(records, Ordering::AcqRel);
    }

    fn inc_write_time(&self, nanos: u64) {
        self.write_time_nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    fn inc_peak_memory_used(&self, bytes: u64) {
        self.peak_memory_used.fetch_add(bytes, Ordering::AcqRel);
    }
}

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

//! Stream adapters shared by the spill writer, the merge engine and the
//! partition-pair writer.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::shuffle::metrics::ShuffleWriteMetrics;

/// Counts every byte accepted by the wrapped writer.
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A counting writer whose counter outlives the wrapper chain it is buried
/// in, for callers that tear the chain down by value.
pub struct SharedCountingWriter<W: Write> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> SharedCountingWriter<W> {
    pub fn new(inner: W, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<W: Write> Write for SharedCountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Terminates a wrapper chain: `flush()` is a no-op, and dropping the
/// shield never closes the wrapped sink. Codec layers above can flush
/// their internal state on close without disturbing the partition sink,
/// which stays open until the outer controller closes it.
pub struct FlushShieldWriter<W: Write> {
    inner: W,
}

impl<W: Write> FlushShieldWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for FlushShieldWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Adds the wall-clock time of every write and flush to the reporter's
/// shuffle write time.
pub struct TimeTrackingWriter<'a, W: Write> {
    inner: W,
    metrics: &'a dyn ShuffleWriteMetrics,
}

impl<'a, W: Write> TimeTrackingWriter<'a, W> {
    pub fn new(inner: W, metrics: &'a dyn ShuffleWriteMetrics) -> Self {
        Self { inner, metrics }
    }
}

impl<W: Write> Write for TimeTrackingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let start = Instant::now();
        let n = self.inner.write(buf)?;
        self.metrics
            .inc_write_time(start.elapsed().as_nanos() as u64);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let start = Instant::now();
        self.inner.flush()?;
        self.metrics
            .inc_write_time(start.elapsed().as_nanos() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shuffle::metrics::TaskWriteMetrics;
    use std::io::BufWriter;

    #[test]
    fn counting_writer_counts() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"hello").unwrap();
        writer.write_all(b" world").unwrap();
        assert_eq!(writer.count(), 11);
        assert_eq!(writer.inner, b"hello world");
    }

    #[test]
    fn shared_counting_writer_counts_through_a_boxed_chain() {
        let count = Arc::new(AtomicU64::new(0));
        let mut sink = Vec::new();
        {
            let counting = SharedCountingWriter::new(&mut sink, Arc::clone(&count));
            let mut chain: Box<dyn Write + '_> = Box::new(counting);
            chain.write_all(b"xyz").unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(sink, b"xyz");
    }

    #[test]
    fn flush_shield_swallows_flush() {
        let mut sink = Vec::new();
        {
            let shield = FlushShieldWriter::new(&mut sink);
            let mut buffered = BufWriter::with_capacity(1024, shield);
            buffered.write_all(b"buffered").unwrap();
            // flushing the buffer pushes bytes through the shield
            buffered.flush().unwrap();
        }
        assert_eq!(sink, b"buffered");

        // a flush that originates above the shield does not reach the sink
        let mut flush_count = FlushCounter::default();
        let mut shield = FlushShieldWriter::new(&mut flush_count);
        shield.flush().unwrap();
        assert_eq!(flush_count.flushes, 0);
    }

    #[derive(Default)]
    struct FlushCounter {
        flushes: usize,
    }

    impl Write for FlushCounter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn time_tracking_writer_reports_nanos() {
        let metrics = TaskWriteMetrics::default();
        let mut sink = Vec::new();
        {
            let mut writer = TimeTrackingWriter::new(&mut sink, &metrics);
            writer.write_all(b"timed").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(sink, b"timed");
    }
}

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

use std::io::Write;

/// A reusable byte sink that exposes its backing storage, so a serialized
/// record can be handed to the sorter without another copy.
#[derive(Debug)]
pub struct SerializationBuffer {
    buf: Vec<u8>,
}

impl SerializationBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Resets the length to zero. Capacity is retained across records.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The first `len()` bytes of the backing storage.
    pub fn raw_view(&self) -> &[u8] {
        &self.buf
    }
}

impl Write for SerializationBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reset_retains_capacity() {
        let mut buffer = SerializationBuffer::with_capacity(16);
        buffer.write_all(&[1u8; 64]).unwrap();
        assert_eq!(buffer.len(), 64);
        let capacity = buffer.buf.capacity();
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.buf.capacity(), capacity);
    }

    #[test]
    fn raw_view_sees_written_bytes() {
        let mut buffer = SerializationBuffer::with_capacity(4);
        buffer.write_all(b"abc").unwrap();
        buffer.write_all(b"def").unwrap();
        assert_eq!(buffer.raw_view(), b"abcdef");
    }
}

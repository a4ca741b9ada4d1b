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

//! Compression codecs for shuffle blocks.

use std::io::{BufReader, Read, Write};

use crate::errors::{ShuffleError, ShuffleResult};

/// The codecs a shuffle writer can wrap partition streams in.
///
/// `None`, `Lz4Frame`, `Zstd` and `Snappy` produce framed streams that stay
/// decodable when concatenated, which is what allows the fast merge to glue
/// spilled partition segments together without decoding them. Raw deflate
/// streams do not survive concatenation, so `Deflate` always forces the
/// slow merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CompressionCodec {
    #[default]
    None,
    Lz4Frame,
    Zstd(i32),
    Snappy,
    Deflate,
}

impl CompressionCodec {
    pub fn from_name(name: &str) -> ShuffleResult<Self> {
        match name {
            "none" => Ok(CompressionCodec::None),
            "lz4" => Ok(CompressionCodec::Lz4Frame),
            "zstd" => Ok(CompressionCodec::Zstd(1)),
            "snappy" => Ok(CompressionCodec::Snappy),
            "deflate" => Ok(CompressionCodec::Deflate),
            other => Err(ShuffleError::Config(format!(
                "unsupported compression codec: {other}"
            ))),
        }
    }

    pub fn supports_concatenation_of_serialized_streams(&self) -> bool {
        !matches!(self, CompressionCodec::Deflate)
    }

    pub fn compressed_output<W: Write>(&self, output: W) -> ShuffleResult<CompressedWriter<W>> {
        match self {
            CompressionCodec::None => Ok(CompressedWriter::Plain(output)),
            CompressionCodec::Lz4Frame => Ok(CompressedWriter::Lz4(
                lz4_flex::frame::FrameEncoder::new(output),
            )),
            CompressionCodec::Zstd(level) => {
                Ok(CompressedWriter::Zstd(zstd::Encoder::new(output, *level)?))
            }
            CompressionCodec::Snappy => Ok(CompressedWriter::Snappy(
                snap::write::FrameEncoder::new(output),
            )),
            CompressionCodec::Deflate => Ok(CompressedWriter::Deflate(
                flate2::write::DeflateEncoder::new(output, flate2::Compression::default()),
            )),
        }
    }

    pub fn compressed_input<R: Read>(&self, input: R) -> ShuffleResult<CompressedReader<R>> {
        match self {
            CompressionCodec::None => Ok(CompressedReader::Plain(input)),
            CompressionCodec::Lz4Frame => Ok(CompressedReader::Lz4(
                lz4_flex::frame::FrameDecoder::new(input),
            )),
            CompressionCodec::Zstd(_) => Ok(CompressedReader::Zstd(zstd::Decoder::new(input)?)),
            CompressionCodec::Snappy => Ok(CompressedReader::Snappy(
                snap::read::FrameDecoder::new(input),
            )),
            CompressionCodec::Deflate => Ok(CompressedReader::Deflate(
                flate2::read::DeflateDecoder::new(input),
            )),
        }
    }
}

/// A compressing writer that must be finished so codec trailers reach the
/// wrapped sink.
pub enum CompressedWriter<W: Write> {
    Plain(W),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Snappy(snap::write::FrameEncoder<W>),
    Deflate(flate2::write::DeflateEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Flushes the codec's internal state, writes any stream trailer and
    /// returns the wrapped sink.
    pub fn finish(self) -> ShuffleResult<W> {
        match self {
            CompressedWriter::Plain(inner) => Ok(inner),
            CompressedWriter::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| ShuffleError::Internal(format!("lz4 compression error: {e}"))),
            CompressedWriter::Zstd(encoder) => Ok(encoder.finish()?),
            CompressedWriter::Snappy(encoder) => encoder.into_inner().map_err(|e| {
                ShuffleError::Internal(format!("snappy compression error: {}", e.error()))
            }),
            CompressedWriter::Deflate(encoder) => Ok(encoder.finish()?),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CompressedWriter::Plain(inner) => inner.write(buf),
            CompressedWriter::Lz4(encoder) => encoder.write(buf),
            CompressedWriter::Zstd(encoder) => encoder.write(buf),
            CompressedWriter::Snappy(encoder) => encoder.write(buf),
            CompressedWriter::Deflate(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CompressedWriter::Plain(inner) => inner.flush(),
            CompressedWriter::Lz4(encoder) => encoder.flush(),
            CompressedWriter::Zstd(encoder) => encoder.flush(),
            CompressedWriter::Snappy(encoder) => encoder.flush(),
            CompressedWriter::Deflate(encoder) => encoder.flush(),
        }
    }
}

/// The decoding side of [`CompressedWriter`].
pub enum CompressedReader<R: Read> {
    Plain(R),
    Lz4(lz4_flex::frame::FrameDecoder<R>),
    Zstd(zstd::Decoder<'static, BufReader<R>>),
    Snappy(snap::read::FrameDecoder<R>),
    Deflate(flate2::read::DeflateDecoder<R>),
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CompressedReader::Plain(inner) => inner.read(buf),
            CompressedReader::Lz4(decoder) => decoder.read(buf),
            CompressedReader::Zstd(decoder) => decoder.read(buf),
            CompressedReader::Snappy(decoder) => decoder.read(buf),
            CompressedReader::Deflate(decoder) => decoder.read(buf),
        }
    }
}

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

//! Common shuffle errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShuffleError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unable to acquire memory: {0}")]
    MemoryExhausted(String),

    #[error("Shuffle Internal Error: {0}")]
    Internal(String),

    /// A secondary failure raised while releasing resources after the
    /// primary operation already succeeded.
    #[error("Cleanup failed: {source}")]
    Cleanup {
        #[source]
        source: Box<ShuffleError>,
    },

    #[error(transparent)]
    IO {
        #[from]
        source: std::io::Error,
    },
}

impl ShuffleError {
    pub fn into_cleanup(self) -> ShuffleError {
        ShuffleError::Cleanup {
            source: Box::new(self),
        }
    }
}

pub type ShuffleResult<T> = Result<T, ShuffleError>;

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

//! Serialized-mode map-side shuffle writer for the Meteor engine.
//!
//! A map task hands its record stream to
//! [`shuffle::SerializedShuffleWriter`], which serializes records into
//! opaque bytes, sorts them by destination partition in memory pages,
//! spills sorted runs under memory pressure and merges everything into one
//! indexed map output file that reduce tasks fetch by partition.

pub mod config;
pub mod errors;
pub mod memory;
pub mod shuffle;

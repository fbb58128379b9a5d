// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Test utilities for the rewards engine.
//!
//! This crate provides synthetic network histories with the canonical fixture node classes,
//! and an in-memory beacon chain that can be told to miss duties or go offline, either called
//! directly or served over HTTP.

pub mod beacon;
pub mod history;
pub mod server;

pub use beacon::MockBeacon;
pub use history::{class, eth, milli, MockHistory, MockMinipool, MockNode, NodeParams};
pub use server::serve_beacon;

/// Write the snapshot of `history` as JSON to `path`.
pub fn write_snapshot(history: &MockHistory, path: impl AsRef<std::path::Path>) -> anyhow::Result<()> {
    let snapshot = history.snapshot_file()?;
    std::fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
    Ok(())
}

/// Write the event of the interval before `history` as JSON to `path`.
pub fn write_previous_event(
    history: &MockHistory,
    path: impl AsRef<std::path::Path>,
) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(&history.previous_event())?)?;
    Ok(())
}

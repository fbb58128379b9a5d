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

//! Check local rewards files against the on-chain anchor, and recover the canonical file
//! from a content store when they disagree.

use async_trait::async_trait;

use crate::{
    events::RewardsEvent,
    files::{rewards_file_name, RewardsFile},
    RewardsError,
};

/// Read access to published rewards files.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch `file_name` published under `cid`.
    async fn fetch(&self, cid: &str, file_name: &str) -> Result<Vec<u8>, RewardsError>;
}

/// Content store backed by a list of HTTP gateways.
///
/// Each gateway is a URL template in which `{cid}` and `{file}` are substituted. Gateways are
/// tried in order until one answers.
#[derive(Debug, Clone)]
pub struct HttpGatewayStore {
    client: reqwest::Client,
    gateways: Vec<String>,
}

pub const DEFAULT_GATEWAYS: &[&str] =
    &["https://{cid}.ipfs.dweb.link/{file}", "https://ipfs.io/ipfs/{cid}/{file}"];

impl HttpGatewayStore {
    pub fn new(gateways: Vec<String>) -> Self {
        Self { client: reqwest::Client::new(), gateways }
    }

    fn url(template: &str, cid: &str, file_name: &str) -> String {
        template.replace("{cid}", cid).replace("{file}", file_name)
    }
}

impl Default for HttpGatewayStore {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAYS.iter().map(|g| g.to_string()).collect())
    }
}

#[async_trait]
impl ContentStore for HttpGatewayStore {
    async fn fetch(&self, cid: &str, file_name: &str) -> Result<Vec<u8>, RewardsError> {
        for template in &self.gateways {
            let url = Self::url(template, cid, file_name);
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Gateway request to {url} failed: {e}");
                    continue;
                }
            };
            if !response.status().is_success() {
                tracing::warn!("Gateway {url} returned {}", response.status());
                continue;
            }
            match response.bytes().await {
                Ok(bytes) => return Ok(bytes.to_vec()),
                Err(e) => tracing::warn!("Failed to read body from {url}: {e}"),
            }
        }
        Err(RewardsError::DataUnavailable(format!(
            "{file_name} ({cid}) not available from any of {} gateways",
            self.gateways.len()
        )))
    }
}

/// Compare a locally built file's root with the on-chain anchor.
pub fn check_root(local: &RewardsFile, event: &RewardsEvent) -> Result<(), RewardsError> {
    if local.merkle_root != event.merkle_root {
        return Err(RewardsError::RootMismatch {
            index: event.index,
            local: local.merkle_root,
            onchain: event.merkle_root,
        });
    }
    Ok(())
}

/// Where the trusted rewards file came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Local(RewardsFile),
    Downloaded(RewardsFile),
}

impl Reconciled {
    pub fn file(&self) -> &RewardsFile {
        match self {
            Reconciled::Local(file) | Reconciled::Downloaded(file) => file,
        }
    }

    pub fn into_file(self) -> RewardsFile {
        match self {
            Reconciled::Local(file) | Reconciled::Downloaded(file) => file,
        }
    }
}

/// Settle on a rewards file that verifies against `event`.
///
/// A local file is kept only if it passes its own checks and matches the anchored root.
/// Otherwise the file named by the event's CID is downloaded and must pass the same checks.
pub async fn reconcile(
    local: Option<RewardsFile>,
    event: &RewardsEvent,
    network: &str,
    store: &dyn ContentStore,
) -> Result<Reconciled, RewardsError> {
    if let Some(local) = local {
        match local.verify_self().and_then(|_| check_root(&local, event)) {
            Ok(()) => return Ok(Reconciled::Local(local)),
            Err(e) => tracing::warn!("Discarding local rewards file for interval {}: {e}", event.index),
        }
    } else {
        tracing::warn!("No local rewards file for interval {}", event.index);
    }

    let file_name = rewards_file_name(network, event.index, true);
    tracing::info!("Downloading {file_name} from {}", event.merkle_tree_cid);
    let bytes = store.fetch(&event.merkle_tree_cid, &file_name).await?;

    let downloaded = RewardsFile::from_bytes(&bytes).map_err(|e| {
        RewardsError::FileIntegrity(format!("downloaded {file_name} does not parse: {e}"))
    })?;
    if downloaded.index != event.index {
        return Err(RewardsError::FileIntegrity(format!(
            "downloaded {file_name} is for interval {}",
            downloaded.index
        )));
    }
    downloaded.verify_self()?;
    check_root(&downloaded, event).map_err(|e| {
        RewardsError::FileIntegrity(format!("downloaded {file_name} does not match the anchor: {e}"))
    })?;
    Ok(Reconciled::Downloaded(downloaded))
}

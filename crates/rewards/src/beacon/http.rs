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

//! [BeaconSource] over the standard beacon node REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use url::Url;

use super::{Attestation, BeaconBlock, BeaconSource, Bits, Committee, ProposerDuty};
use crate::RewardsError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct HttpBeaconClient {
    client: reqwest::Client,
    base_url: Url,
    slots_per_epoch: u64,
}

impl HttpBeaconClient {
    pub fn new(base_url: Url, slots_per_epoch: u64) -> Result<Self, RewardsError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RewardsError::DataUnavailable(format!("failed to build client: {e}")))?;
        Ok(Self { client, base_url, slots_per_epoch })
    }

    /// GET `path` and decode the `data` field. A 404 yields `None`.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, RewardsError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| RewardsError::DataUnavailable(format!("invalid beacon path {path}: {e}")))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RewardsError::DataUnavailable(format!("GET {path}: {e}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RewardsError::DataUnavailable(format!(
                "GET {path} returned {}",
                response.status()
            )));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| RewardsError::DataUnavailable(format!("decoding {path}: {e}")))?;
        Ok(Some(envelope.data))
    }

    fn state_id(&self, epoch: u64) -> u64 {
        epoch * self.slots_per_epoch
    }
}

#[async_trait]
impl BeaconSource for HttpBeaconClient {
    async fn committees(&self, epoch: u64) -> Result<Vec<Committee>, RewardsError> {
        let path =
            format!("eth/v1/beacon/states/{}/committees?epoch={epoch}", self.state_id(epoch));
        let committees: Vec<CommitteeJson> = self
            .get(&path)
            .await?
            .ok_or_else(|| RewardsError::DataUnavailable(format!("no committees for epoch {epoch}")))?;
        Ok(committees
            .into_iter()
            .map(|c| Committee { slot: c.slot, index: c.index, validators: c.validators })
            .collect())
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, RewardsError> {
        let duties: Vec<ProposerDutyJson> =
            self.get(&format!("eth/v1/validator/duties/proposer/{epoch}")).await?.ok_or_else(
                || RewardsError::DataUnavailable(format!("no proposer duties for epoch {epoch}")),
            )?;
        Ok(duties
            .into_iter()
            .map(|d| ProposerDuty { slot: d.slot, validator_index: d.validator_index })
            .collect())
    }

    async fn sync_committee(&self, epoch: u64) -> Result<Vec<u64>, RewardsError> {
        let path =
            format!("eth/v1/beacon/states/{}/sync_committees?epoch={epoch}", self.state_id(epoch));
        // Epochs before sync committees existed have none.
        Ok(self.get::<SyncCommitteeJson>(&path).await?.map(|s| s.validators).unwrap_or_default())
    }

    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>, RewardsError> {
        let Some(block) = self.get::<SignedBlockJson>(&format!("eth/v2/beacon/blocks/{slot}")).await?
        else {
            return Ok(None);
        };
        let message = block.message;
        let attestations = message
            .body
            .attestations
            .into_iter()
            .map(|a| {
                let committee_bits = match &a.committee_bits {
                    Some(bits) => Some(Bits::from_bitvector(&decode_hex(bits)?)),
                    None => None,
                };
                Ok(Attestation {
                    slot: a.data.slot,
                    committee_index: a.data.index,
                    committee_bits,
                    aggregation_bits: Bits::from_ssz_bitlist(&decode_hex(&a.aggregation_bits)?)?,
                })
            })
            .collect::<Result<Vec<_>, RewardsError>>()?;
        let sync_committee_bits = match message.body.sync_aggregate {
            Some(aggregate) => Some(Bits::from_bitvector(&decode_hex(&aggregate.sync_committee_bits)?)),
            None => None,
        };
        Ok(Some(BeaconBlock {
            slot: message.slot,
            proposer_index: message.proposer_index,
            execution_block_number: message.body.execution_payload.map(|p| p.block_number),
            attestations,
            sync_committee_bits,
        }))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, RewardsError> {
    hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| RewardsError::DataUnavailable(format!("invalid hex field {s}: {e}")))
}

/// The beacon API quotes all integers.
fn quoted_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn quoted_u64_vec<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .collect()
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct CommitteeJson {
    #[serde(deserialize_with = "quoted_u64")]
    index: u64,
    #[serde(deserialize_with = "quoted_u64")]
    slot: u64,
    #[serde(deserialize_with = "quoted_u64_vec")]
    validators: Vec<u64>,
}

#[derive(Deserialize)]
struct ProposerDutyJson {
    #[serde(deserialize_with = "quoted_u64")]
    validator_index: u64,
    #[serde(deserialize_with = "quoted_u64")]
    slot: u64,
}

#[derive(Deserialize)]
struct SyncCommitteeJson {
    #[serde(deserialize_with = "quoted_u64_vec")]
    validators: Vec<u64>,
}

#[derive(Deserialize)]
struct SignedBlockJson {
    message: BlockMessageJson,
}

#[derive(Deserialize)]
struct BlockMessageJson {
    #[serde(deserialize_with = "quoted_u64")]
    slot: u64,
    #[serde(deserialize_with = "quoted_u64")]
    proposer_index: u64,
    body: BlockBodyJson,
}

#[derive(Deserialize)]
struct BlockBodyJson {
    #[serde(default)]
    attestations: Vec<AttestationJson>,
    sync_aggregate: Option<SyncAggregateJson>,
    execution_payload: Option<ExecutionPayloadJson>,
}

#[derive(Deserialize)]
struct AttestationJson {
    aggregation_bits: String,
    /// Present from Electra on, where `data.index` is always zero.
    committee_bits: Option<String>,
    data: AttestationDataJson,
}

#[derive(Deserialize)]
struct AttestationDataJson {
    #[serde(deserialize_with = "quoted_u64")]
    slot: u64,
    #[serde(deserialize_with = "quoted_u64")]
    index: u64,
}

#[derive(Deserialize)]
struct SyncAggregateJson {
    sync_committee_bits: String,
}

#[derive(Deserialize)]
struct ExecutionPayloadJson {
    #[serde(deserialize_with = "quoted_u64")]
    block_number: u64,
}

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

//! A [MockBeacon] served over the beacon node REST API.

use std::sync::Arc;

use rpl_rewards::{beacon::Bits, BeaconBlock, RewardsError};
use serde_json::{json, Value};
use wiremock::{matchers::method, Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::MockBeacon;

/// Start a server answering the beacon API endpoints the engine uses from `beacon`.
///
/// Requests the mock refuses get a 503, empty slots a 404.
pub async fn serve_beacon(beacon: MockBeacon) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(BeaconApi { beacon: Arc::new(beacon) })
        .mount(&server)
        .await;
    server
}

struct BeaconApi {
    beacon: Arc<MockBeacon>,
}

impl Respond for BeaconApi {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match self.route(request) {
            Ok(Some(data)) => ResponseTemplate::new(200).set_body_json(json!({ "data": data })),
            Ok(None) => ResponseTemplate::new(404),
            Err(err) => ResponseTemplate::new(503).set_body_string(err.to_string()),
        }
    }
}

impl BeaconApi {
    fn route(&self, request: &Request) -> Result<Option<Value>, RewardsError> {
        let epoch_param = || {
            request
                .url
                .query_pairs()
                .find(|(key, _)| key == "epoch")
                .and_then(|(_, value)| value.parse::<u64>().ok())
        };
        let segments: Vec<&str> = request.url.path().trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["eth", "v1", "beacon", "states", _, "committees"] => {
                let Some(epoch) = epoch_param() else { return Ok(None) };
                let committees: Vec<Value> = self
                    .beacon
                    .committees_of(epoch)?
                    .into_iter()
                    .map(|c| {
                        json!({
                            "index": c.index.to_string(),
                            "slot": c.slot.to_string(),
                            "validators": quoted(&c.validators),
                        })
                    })
                    .collect();
                Ok(Some(Value::Array(committees)))
            }
            ["eth", "v1", "beacon", "states", _, "sync_committees"] => {
                let Some(epoch) = epoch_param() else { return Ok(None) };
                let members = self.beacon.sync_committee_of(epoch)?;
                Ok(Some(json!({ "validators": quoted(&members) })))
            }
            ["eth", "v1", "validator", "duties", "proposer", epoch] => {
                let Ok(epoch) = epoch.parse::<u64>() else { return Ok(None) };
                let duties: Vec<Value> = self
                    .beacon
                    .proposers_of(epoch)?
                    .into_iter()
                    .map(|d| {
                        json!({
                            "validator_index": d.validator_index.to_string(),
                            "slot": d.slot.to_string(),
                        })
                    })
                    .collect();
                Ok(Some(Value::Array(duties)))
            }
            ["eth", "v2", "beacon", "blocks", slot] => {
                let Ok(slot) = slot.parse::<u64>() else { return Ok(None) };
                Ok(self.beacon.block_at(slot)?.map(|block| block_json(&block)))
            }
            _ => Ok(None),
        }
    }
}

fn quoted(values: &[u64]) -> Vec<String> {
    values.iter().map(u64::to_string).collect()
}

fn block_json(block: &BeaconBlock) -> Value {
    let attestations: Vec<Value> = block
        .attestations
        .iter()
        .map(|a| {
            json!({
                "aggregation_bits": bitlist_hex(&a.aggregation_bits),
                "data": { "slot": a.slot.to_string(), "index": a.committee_index.to_string() },
            })
        })
        .collect();
    let mut body = json!({ "attestations": attestations });
    if let Some(bits) = &block.sync_committee_bits {
        body["sync_aggregate"] = json!({ "sync_committee_bits": bitvector_hex(bits) });
    }
    if let Some(number) = block.execution_block_number {
        body["execution_payload"] = json!({ "block_number": number.to_string() });
    }
    json!({
        "message": {
            "slot": block.slot.to_string(),
            "proposer_index": block.proposer_index.to_string(),
            "body": body,
        }
    })
}

fn packed(bits: &Bits, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len.div_ceil(8)];
    for i in (0..bits.len()).filter(|i| bits.get(*i)) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

/// SSZ bitlist: the bits followed by a delimiter bit.
fn bitlist_hex(bits: &Bits) -> String {
    let mut bytes = packed(bits, bits.len() + 1);
    bytes[bits.len() / 8] |= 1 << (bits.len() % 8);
    format!("0x{}", hex::encode(bytes))
}

fn bitvector_hex(bits: &Bits) -> String {
    format!("0x{}", hex::encode(packed(bits, bits.len())))
}

//! Adapter for the representative ed25519 chain family.
//!
//! Talks to a channel-registry gateway over REST: claims are posted as JSON
//! and channel state is read back with stringified integer fields. Gas and
//! transaction assembly live behind the gateway; the connector only ever
//! sees claim-level semantics.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::chain::{ChainAdapter, ChainError, OnChainChannelState, SubmitOutcome};
use crate::claim::{Claim, ChannelOwner};
use crate::config::SettlementInfraConfig;
use crate::types::ChainTag;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AptosAdapter {
    http: reqwest::Client,
    rpc_url: Url,
    registry_address: String,
    token_address: String,
    tag: ChainTag,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitClaimRequest<'a> {
    registry: &'a str,
    token: &'a str,
    #[serde(flatten)]
    claim: &'a Claim,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStateResponse {
    deposit: String,
    redeemed: String,
    nonce: u64,
}

impl AptosAdapter {
    pub fn from_config(infra: &SettlementInfraConfig) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(AptosAdapter {
            http,
            rpc_url: infra.rpc_url.clone(),
            registry_address: infra.registry_address.clone(),
            token_address: infra.token_address.clone(),
            tag: infra.chain_tag.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ChainError> {
        self.rpc_url
            .join(path)
            .map_err(|e| ChainError::MalformedResponse(format!("bad endpoint {path}: {e}")))
    }

    fn parse_u128(value: &str, field: &str) -> Result<u128, ChainError> {
        value
            .parse::<u128>()
            .map_err(|_| ChainError::MalformedResponse(format!("{field} is not an integer: {value}")))
    }
}

#[async_trait]
impl ChainAdapter for AptosAdapter {
    fn tag(&self) -> &ChainTag {
        &self.tag
    }

    async fn submit_claim(&self, claim: &Claim) -> Result<SubmitOutcome, ChainError> {
        let url = self.endpoint("v1/channel-claims")?;
        let body = SubmitClaimRequest {
            registry: &self.registry_address,
            token: &self.token_address,
            claim,
        };
        let response = self.http.post(url).json(&body).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(SubmitOutcome::Applied),
            // The registry has already applied this nonce.
            StatusCode::CONFLICT => Ok(SubmitOutcome::AlreadyApplied),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(ChainError::Rpc(status.as_u16(), text))
            }
        }
    }

    async fn channel_state(&self, owner: &ChannelOwner) -> Result<OnChainChannelState, ChainError> {
        let path = format!(
            "v1/channels/{}/{}",
            self.registry_address,
            hex::encode(owner.as_bytes())
        );
        let url = self.endpoint(&path)?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ChainError::Rpc(status, text));
        }
        let state: ChannelStateResponse = response
            .json()
            .await
            .map_err(|e| ChainError::MalformedResponse(e.to_string()))?;
        Ok(OnChainChannelState {
            deposit: Self::parse_u128(&state.deposit, "deposit")?,
            redeemed: Self::parse_u128(&state.redeemed, "redeemed")?,
            nonce: state.nonce,
        })
    }

    async fn health(&self) -> bool {
        match self.endpoint("v1") {
            Ok(url) => matches!(
                self.http.get(url).send().await,
                Ok(r) if r.status().is_success()
            ),
            Err(_) => false,
        }
    }
}

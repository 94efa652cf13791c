use core::{
    fmt::{Debug, Formatter, Result as FmtResult},
    time::Duration,
};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use log::debug;
use mime::{APPLICATION_JSON, TEXT_EVENT_STREAM};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT},
    Client, RequestBuilder, StatusCode,
};
use serde::de::DeserializeOwned;
use snap::raw::{Decoder, Encoder};
use types::{
    containers::{
        BlockRewards, BlockSize, FinalityCheckpoints, NormalizedBlock, NormalizedState,
        ProposerDuty,
    },
    primitives::{Epoch, Slot, UnixSeconds, H256},
    redacting_url::{BasicAuth, RedactingUrl},
};
use url::Url;

use crate::{
    events::{self, Topic},
    ids::{BlockId, StateId},
    node::{BeaconNode, EventStream, NodeError},
    raw::{
        self, Data, RawBlockRewards, RawFinality, RawGenesis, RawProposerDuty, RootResponse,
        Versioned,
    },
};

const API_KEY_HEADER: &str = "x-goog-api-key";
const CF_ACCESS_CLIENT_ID_HEADER: &str = "cf-access-client-id";
const CF_ACCESS_CLIENT_SECRET_HEADER: &str = "cf-access-client-secret";

/// Extra headers required by hosted or proxied nodes.
#[derive(Clone, Default)]
pub struct AccessHeaders {
    pub api_key: Option<String>,
    pub cf_access_client_id: Option<String>,
    pub cf_access_client_secret: Option<String>,
}

// Only the presence of each header is printed.
impl Debug for AccessHeaders {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        formatter
            .debug_struct("AccessHeaders")
            .field("api_key", &self.api_key.is_some())
            .field("cf_access_client_id", &self.cf_access_client_id.is_some())
            .field("cf_access_client_secret", &self.cf_access_client_secret.is_some())
            .finish()
    }
}

impl AccessHeaders {
    fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        for (name, value) in [
            (API_KEY_HEADER, &self.api_key),
            (CF_ACCESS_CLIENT_ID_HEADER, &self.cf_access_client_id),
            (CF_ACCESS_CLIENT_SECRET_HEADER, &self.cf_access_client_secret),
        ] {
            if let Some(value) = value {
                let mut value = HeaderValue::from_str(value)?;
                value.set_sensitive(true);
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        Ok(headers)
    }
}

/// Thin client shared by the consensus and execution node implementations.
pub struct HttpClient {
    client: Client,
    endpoint: Url,
    basic_auth: Option<BasicAuth>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(endpoint: RedactingUrl, access: &AccessHeaders, timeout: Duration) -> Result<Self> {
        let (endpoint, basic_auth) = endpoint.into_parts();

        let client = Client::builder()
            .connect_timeout(timeout)
            .default_headers(access.header_map()?)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            basic_auth,
            timeout,
        })
    }

    pub fn url(&self, path: &str) -> Result<Url, NodeError> {
        let base = self.endpoint.as_str().trim_end_matches('/');

        Url::parse(&format!("{base}{path}")).map_err(|error| NodeError::Connection {
            resource: path.to_owned(),
            message: error.to_string(),
        })
    }

    #[must_use]
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.basic_auth {
            Some(BasicAuth { username, password }) => request.basic_auth(username, password.as_ref()),
            None => request,
        }
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns `Ok(None)` if the node responds with 404.
    async fn get(&self, resource: &str, path: &str) -> Result<Option<Bytes>, NodeError> {
        let request = self
            .client
            .get(self.url(path)?)
            .timeout(self.timeout)
            .header(ACCEPT, APPLICATION_JSON.as_ref());

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| transport_error(resource, &error))?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            debug!("{resource} not found at {path}");
            return Ok(None);
        }

        if !status.is_success() {
            return Err(NodeError::Status {
                resource: resource.to_owned(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map(Some)
            .map_err(|error| transport_error(resource, &error))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        path: &str,
    ) -> Result<Option<T>, NodeError> {
        match self.get(resource, path).await? {
            Some(bytes) => decode(resource, &bytes).map(Some),
            None => Ok(None),
        }
    }
}

pub fn transport_error(resource: &str, error: &reqwest::Error) -> NodeError {
    if error.is_timeout() {
        NodeError::Timeout {
            resource: resource.to_owned(),
        }
    } else if error.is_decode() {
        NodeError::malformed(resource, error)
    } else {
        NodeError::Connection {
            resource: resource.to_owned(),
            message: error.to_string(),
        }
    }
}

pub fn decode<T: DeserializeOwned>(resource: &str, bytes: &[u8]) -> Result<T, NodeError> {
    serde_json::from_slice(bytes).map_err(|error| NodeError::malformed(resource, error))
}

fn not_found(resource: &str) -> NodeError {
    NodeError::Status {
        resource: resource.to_owned(),
        status: StatusCode::NOT_FOUND.as_u16(),
    }
}

/// Measures how well a block compresses with Snappy and how long the round trip takes.
pub fn measure_size(resource: &str, bytes: &[u8]) -> Result<BlockSize, NodeError> {
    let compression_start = Instant::now();

    let compressed = Encoder::new()
        .compress_vec(bytes)
        .map_err(|error| NodeError::malformed(resource, error))?;

    let compression_micros = elapsed_micros(compression_start);
    let decompression_start = Instant::now();

    Decoder::new()
        .decompress_vec(&compressed)
        .map_err(|error| NodeError::malformed(resource, error))?;

    Ok(BlockSize {
        raw_bytes: bytes.len(),
        compressed_bytes: compressed.len(),
        compression_micros,
        decompression_micros: elapsed_micros(decompression_start),
    })
}

fn elapsed_micros(start: Instant) -> u64 {
    start.elapsed().as_micros().try_into().unwrap_or(u64::MAX)
}

/// [`BeaconNode`] backed by the standard Beacon API over HTTP.
pub struct HttpBeaconNode {
    http: HttpClient,
}

impl HttpBeaconNode {
    #[must_use]
    pub const fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BeaconNode for HttpBeaconNode {
    async fn genesis_time(&self) -> Result<UnixSeconds, NodeError> {
        let resource = "genesis";

        self.http
            .get_json::<Data<RawGenesis>>(resource, "/eth/v1/beacon/genesis")
            .await?
            .map(|response| response.data.genesis_time)
            .ok_or_else(|| not_found(resource))
    }

    async fn state(&self, state_id: StateId) -> Result<Option<NormalizedState>, NodeError> {
        let resource = format!("state={state_id}");
        let path = format!("/eth/v2/debug/beacon/states/{state_id}");

        self.http
            .get_json::<Versioned<raw::RawState>>(&resource, &path)
            .await?
            .map(|response| raw::normalize_state(&resource, response))
            .transpose()
    }

    async fn state_root(&self, state_id: StateId) -> Result<Option<H256>, NodeError> {
        let resource = format!("state_root={state_id}");
        let path = format!("/eth/v1/beacon/states/{state_id}/root");

        let response = self
            .http
            .get_json::<Data<RootResponse>>(&resource, &path)
            .await?;

        Ok(response.map(|response| response.data.root))
    }

    async fn finality(&self, state_id: StateId) -> Result<FinalityCheckpoints, NodeError> {
        let resource = format!("finality={state_id}");
        let path = format!("/eth/v1/beacon/states/{state_id}/finality_checkpoints");

        self.http
            .get_json::<Data<RawFinality>>(&resource, &path)
            .await?
            .map(|response| response.data.into())
            .ok_or_else(|| not_found(&resource))
    }

    async fn block(&self, block_id: BlockId) -> Result<Option<NormalizedBlock>, NodeError> {
        let resource = format!("block={block_id}");
        let root_path = format!("/eth/v1/beacon/blocks/{block_id}/root");

        let Some(root) = self
            .http
            .get_json::<Data<RootResponse>>(&resource, &root_path)
            .await?
        else {
            return Ok(None);
        };

        let root = root.data.root;
        let block_path = format!("/eth/v2/beacon/blocks/{root:?}");

        let Some(bytes) = self.http.get(&resource, &block_path).await? else {
            return Ok(None);
        };

        let size = measure_size(&resource, &bytes)?;
        let response = decode(&resource, &bytes)?;

        raw::normalize_block(&resource, root, response, size).map(Some)
    }

    async fn block_rewards(&self, slot: Slot) -> Result<Option<BlockRewards>, NodeError> {
        let resource = format!("block_rewards={slot}");
        let path = format!("/eth/v1/beacon/rewards/blocks/{slot}");

        let response = self
            .http
            .get_json::<Data<RawBlockRewards>>(&resource, &path)
            .await?;

        Ok(response.map(|response| response.data.into()))
    }

    async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDuty>, NodeError> {
        let resource = format!("proposer_duties={epoch}");
        let path = format!("/eth/v1/validator/duties/proposer/{epoch}");

        let response = self
            .http
            .get_json::<Data<Vec<RawProposerDuty>>>(&resource, &path)
            .await?
            .ok_or_else(|| not_found(&resource))?;

        Ok(response.data.into_iter().map(Into::into).collect())
    }

    async fn events(&self) -> Result<EventStream, NodeError> {
        let path = format!("/eth/v1/events?topics={}", Topic::query());

        let request = self
            .http
            .client()
            .get(self.http.url(&path)?)
            .header(ACCEPT, TEXT_EVENT_STREAM.as_ref());

        let response = self
            .http
            .authorize(request)
            .send()
            .await
            .map_err(|error| transport_error(events::RESOURCE, &error))?;

        let status = response.status();

        if !status.is_success() {
            return Err(NodeError::Status {
                resource: events::RESOURCE.to_owned(),
                status: status.as_u16(),
            });
        }

        let chunks = response.bytes_stream();

        Ok(events::parse_events(chunks, |error| transport_error(events::RESOURCE, &error)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use httpmock::{Method, MockServer};
    use types::nonstandard::Phase;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn node(server: &MockServer) -> Result<HttpBeaconNode> {
        let http = HttpClient::new(server.url("/").parse()?, &AccessHeaders::default(), TIMEOUT)?;
        Ok(HttpBeaconNode::new(http))
    }

    #[tokio::test]
    async fn missing_block_is_none() -> Result<()> {
        let server = MockServer::start();

        let mock = server.mock(|when, then| {
            when.method(Method::GET).path("/eth/v1/beacon/blocks/12/root");
            then.status(404).body(r#"{"code":404,"message":"NOT_FOUND: beacon block"}"#);
        });

        assert_eq!(node(&server)?.block(BlockId::Slot(12)).await?, None);

        mock.assert();

        Ok(())
    }

    #[tokio::test]
    async fn server_errors_are_classified() -> Result<()> {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(Method::GET).path("/eth/v1/beacon/states/31/root");
            then.status(503);
        });

        let error = node(&server)?
            .state_root(StateId::Slot(31))
            .await
            .expect_err("503 should be an error");

        assert_eq!(
            error,
            NodeError::Status {
                resource: "state_root=31".to_owned(),
                status: 503,
            },
        );
        assert!(error.is_transient());

        Ok(())
    }

    #[tokio::test]
    async fn phase0_state_is_unsupported() -> Result<()> {
        let server = MockServer::start();

        server.mock(|when, then| {
            when.method(Method::GET).path("/eth/v2/debug/beacon/states/31");
            then.status(200).body(
                r#"{
                    "version": "phase0",
                    "data": {
                        "genesis_time": "0",
                        "slot": "31",
                        "validators": [],
                        "balances": [],
                        "current_justified_checkpoint": {
                            "epoch": "0",
                            "root": "0x0000000000000000000000000000000000000000000000000000000000000000"
                        },
                        "finalized_checkpoint": {
                            "epoch": "0",
                            "root": "0x0000000000000000000000000000000000000000000000000000000000000000"
                        }
                    }
                }"#,
            );
        });

        let error = node(&server)?
            .state(StateId::Slot(31))
            .await
            .expect_err("phase0 state should be rejected");

        assert_eq!(
            error,
            NodeError::UnsupportedPhase {
                resource: "state=31".to_owned(),
                phase: Phase::Phase0,
            },
        );

        Ok(())
    }

    #[tokio::test]
    async fn sends_credentials_and_access_headers() -> Result<()> {
        let server = MockServer::start();

        let mock = server.mock(|when, then| {
            when.method(Method::GET)
                .path("/eth/v1/beacon/rewards/blocks/64")
                .header("x-goog-api-key", "key")
                .header("cf-access-client-id", "client")
                // `user:secret` in Base64.
                .header("authorization", "Basic dXNlcjpzZWNyZXQ=");
            then.status(200).body(
                r#"{
                    "execution_optimistic": false,
                    "finalized": true,
                    "data": {
                        "proposer_index": "5",
                        "total": "40",
                        "attestations": "30",
                        "sync_aggregate": "10",
                        "proposer_slashings": "0",
                        "attester_slashings": "0"
                    }
                }"#,
            );
        });

        let url = format!("http://user:secret@{}/", server.address()).parse()?;

        let access = AccessHeaders {
            api_key: Some("key".to_owned()),
            cf_access_client_id: Some("client".to_owned()),
            cf_access_client_secret: None,
        };

        let http = HttpClient::new(url, &access, TIMEOUT)?;
        let rewards = HttpBeaconNode::new(http).block_rewards(64).await?;

        mock.assert();

        assert_eq!(
            rewards,
            Some(BlockRewards {
                proposer_index: 5,
                total: 40,
                attestations: 30,
                sync_aggregate: 10,
                proposer_slashings: 0,
                attester_slashings: 0,
            }),
        );

        Ok(())
    }

    #[test]
    fn measures_compression() -> Result<()> {
        let bytes = vec![7; 4096];
        let size = measure_size("block=1", &bytes)?;

        assert_eq!(size.raw_bytes, 4096);
        assert!(size.compressed_bytes < size.raw_bytes);

        Ok(())
    }
}

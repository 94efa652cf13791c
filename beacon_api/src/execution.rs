use async_trait::async_trait;
use mime::APPLICATION_JSON;
use reqwest::header::CONTENT_TYPE;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use types::{
    containers::{Eth1Deposit, Transaction},
    primitives::{ExecutionAddress, ExecutionBlockNumber, H256, U256, U64},
};

use crate::{
    deposit_event::{self, RawLog},
    http::{self, HttpClient},
    node::{ExecutionNode, NodeError},
};

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RawExecutionBlock {
    transactions: Vec<RawTransaction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: H256,
    #[serde(rename = "type", default)]
    transaction_type: U64,
    chain_id: Option<U64>,
    nonce: U64,
    gas: U64,
    gas_price: Option<U256>,
    max_priority_fee_per_gas: Option<U256>,
    max_fee_per_gas: Option<U256>,
    value: U256,
    from: ExecutionAddress,
    to: Option<ExecutionAddress>,
    input: String,
}

impl From<RawTransaction> for Transaction {
    fn from(raw: RawTransaction) -> Self {
        let RawTransaction {
            hash,
            transaction_type,
            chain_id,
            nonce,
            gas,
            gas_price,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            value,
            from,
            to,
            input,
        } = raw;

        Self {
            hash,
            tx_type: transaction_type.as_u64(),
            chain_id: chain_id.map(|chain_id| chain_id.as_u64()),
            nonce: nonce.as_u64(),
            gas: gas.as_u64(),
            gas_price,
            gas_tip_cap: max_priority_fee_per_gas,
            gas_fee_cap: max_fee_per_gas,
            value,
            from,
            to,
            input_size: input.trim_start_matches("0x").len() / 2,
        }
    }
}

/// [`ExecutionNode`] backed by the execution client's JSON-RPC interface.
pub struct HttpExecutionNode {
    http: HttpClient,
}

impl HttpExecutionNode {
    #[must_use]
    pub const fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

impl HttpExecutionNode {
    async fn call<T: DeserializeOwned>(
        &self,
        resource: &str,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, NodeError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let request = self
            .http
            .client()
            .post(self.http.url("")?)
            .timeout(self.http.timeout())
            .header(CONTENT_TYPE, APPLICATION_JSON.as_ref())
            .body(body.to_string());

        let response = self
            .http
            .authorize(request)
            .send()
            .await
            .map_err(|error| http::transport_error(resource, &error))?;

        let status = response.status();

        if !status.is_success() {
            return Err(NodeError::Status {
                resource: resource.to_owned(),
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| http::transport_error(resource, &error))?;

        let JsonRpcResponse { result, error } =
            http::decode::<JsonRpcResponse<T>>(resource, &bytes)?;

        if let Some(JsonRpcError { code, message }) = error {
            return Err(NodeError::malformed(
                resource,
                format_args!("JSON-RPC error {code}: {message}"),
            ));
        }

        Ok(result)
    }
}

#[async_trait]
impl ExecutionNode for HttpExecutionNode {
    async fn transactions(
        &self,
        block_number: ExecutionBlockNumber,
    ) -> Result<Vec<Transaction>, NodeError> {
        let resource = format!("transactions={block_number}");
        let params = json!([format!("{block_number:#x}"), true]);

        let block = self
            .call::<RawExecutionBlock>(&resource, "eth_getBlockByNumber", params)
            .await?;

        // The execution client may lag behind the beacon node it is paired with.
        let block = block.ok_or_else(|| NodeError::Connection {
            resource: resource.clone(),
            message: format!("execution block {block_number} is not available yet"),
        })?;

        Ok(block.transactions.into_iter().map(Into::into).collect())
    }

    async fn deposits(
        &self,
        block_number: ExecutionBlockNumber,
        contract: ExecutionAddress,
    ) -> Result<Vec<Eth1Deposit>, NodeError> {
        let resource = format!("deposits={block_number}");
        let block_number = format!("{block_number:#x}");

        let params = json!([{
            "fromBlock": block_number,
            "toBlock": block_number,
            "address": contract,
            "topics": [deposit_event::TOPIC],
        }]);

        let logs = self
            .call::<Vec<RawLog>>(&resource, "eth_getLogs", params)
            .await?
            .unwrap_or_default();

        logs.into_iter()
            .map(|log| deposit_event::decode(&resource, log))
            .collect()
    }
}

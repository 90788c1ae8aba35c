//! bitcoind JSON-RPC backend.
//!
//! Implements [`UtxoProvider`] over `gettxout`, `getblockcount` and
//! `sendrawtransaction`, and feeds new mempool transactions to the double-spend
//! detector by diffing `getrawmempool`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use wabisabi_core::{BitcoinRpcConfig, CoordinatorError, Result, UtxoInfo, UtxoProvider};

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxOutResult {
    confirmations: u32,
    value: f64,
    script_pub_key: ScriptPubKey,
    #[serde(default)]
    coinbase: bool,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKey {
    hex: String,
}

/// JSON-RPC client for a bitcoind node.
pub struct BitcoindRpc {
    http_client: reqwest::Client,
    uri: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl BitcoindRpc {
    pub fn new(config: &BitcoinRpcConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CoordinatorError::ConfigError(format!("Failed to create RPC client: {}", e)))?;

        Ok(Self {
            http_client,
            uri: config.uri.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    #[instrument(skip(self, params), level = "debug")]
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params });

        let mut request = self.http_client.post(&self.uri).json(&body);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CoordinatorError::ConnectionTimeout(format!("{}: {}", method, e))
            } else {
                CoordinatorError::RpcError(format!("{}: {}", method, e))
            }
        })?;

        // bitcoind reports RPC errors with a 500 status and a JSON body.
        let status = response.status();
        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| CoordinatorError::RpcError(format!("{}: HTTP {} with unreadable body: {}", method, status, e)))?;

        if let Some(error) = parsed.error {
            return Err(CoordinatorError::RpcError(format!("{}: {} ({})", method, error.message, error.code)));
        }
        Ok(parsed.result)
    }

    async fn call_required<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call(method, params)
            .await?
            .ok_or_else(|| CoordinatorError::RpcError(format!("{}: empty result", method)))
    }

    /// Txids currently in the node's mempool.
    pub async fn get_raw_mempool(&self) -> Result<Vec<Txid>> {
        let ids: Vec<String> = self.call_required("getrawmempool", json!([])).await?;
        Ok(ids.iter().filter_map(|id| id.parse().ok()).collect())
    }

    /// Fetches a transaction by id. None if the node no longer knows it.
    pub async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>> {
        match self.call::<String>("getrawtransaction", json!([txid.to_string()])).await {
            Ok(Some(hex)) => encode::deserialize_hex(&hex)
                .map(Some)
                .map_err(|e| CoordinatorError::EncodingError(format!("getrawtransaction {}: {}", txid, e))),
            Ok(None) => Ok(None),
            // Evicted between listing and fetching.
            Err(CoordinatorError::RpcError(msg)) if msg.contains("(-5)") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl UtxoProvider for BitcoindRpc {
    async fn get_tx_out(&self, outpoint: &OutPoint, include_mempool: bool) -> Result<Option<UtxoInfo>> {
        let result: Option<TxOutResult> = self
            .call("gettxout", json!([outpoint.txid.to_string(), outpoint.vout, include_mempool]))
            .await?;

        result
            .map(|r| {
                let value = Amount::from_btc(r.value)
                    .map_err(|e| CoordinatorError::RpcError(format!("gettxout: bad value {}: {}", r.value, e)))?;
                let script_pubkey = ScriptBuf::from_bytes(hex::decode(&r.script_pub_key.hex)?);
                Ok(UtxoInfo {
                    tx_out: TxOut { value, script_pubkey },
                    confirmations: r.confirmations,
                    is_coinbase: r.coinbase,
                })
            })
            .transpose()
    }

    async fn get_block_count(&self) -> Result<u64> {
        self.call_required("getblockcount", json!([])).await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let hex = encode::serialize_hex(tx);
        let txid: String = match self.call_required("sendrawtransaction", json!([hex])).await {
            Ok(txid) => txid,
            Err(CoordinatorError::RpcError(msg)) => return Err(CoordinatorError::BroadcastRejected(msg)),
            Err(e) => return Err(e),
        };
        txid.parse()
            .map_err(|e| CoordinatorError::RpcError(format!("sendrawtransaction: bad txid {}: {}", txid, e)))
    }
}

/// Publishes transactions as they enter the node's mempool.
pub struct MempoolPoller {
    rpc: Arc<BitcoindRpc>,
    interval: Duration,
    sender: broadcast::Sender<Transaction>,
    seen: HashSet<Txid>,
}

impl MempoolPoller {
    pub fn new(rpc: Arc<BitcoindRpc>, interval: Duration, sender: broadcast::Sender<Transaction>) -> Self {
        Self {
            rpc,
            interval,
            sender,
            seen: HashSet::new(),
        }
    }

    /// Lists the mempool once and publishes transactions not seen before.
    /// Returns how many were published.
    pub async fn poll(&mut self) -> Result<usize> {
        let current: HashSet<Txid> = self.rpc.get_raw_mempool().await?.into_iter().collect();

        let mut published = 0;
        for txid in current.difference(&self.seen) {
            if let Some(tx) = self.rpc.get_raw_transaction(txid).await? {
                // No receivers only while shutting down.
                let _ = self.sender.send(tx);
                published += 1;
            }
        }

        self.seen = current;
        Ok(published)
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Mempool poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.poll().await {
                    Ok(0) => {}
                    Ok(published) => debug!(published, "New mempool transactions"),
                    Err(e) => warn!(error = %e, "Mempool poll failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Mempool poller stopped");
    }
}

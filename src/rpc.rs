use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::Address;
use crate::transaction::TxHash;

/// 交易回执 (一次确认)。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    /// 执行是否成功。
    pub status: bool,
}

/// 从账本查回的交易。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionView {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub input: Vec<u8>,
    pub block_number: Option<u64>,
}

/// 账本 RPC (Ledger RPC)
///
/// 账本节点是外部协作方，这里只定义消费的接口。实现方可以是真实的 JSON-RPC 节点，
/// 也可以是进程内的开发账本。所有调用都可能在网络等待处挂起，内部不设超时。
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// 链 id，同时用作连通性检查。
    async fn chain_id(&self) -> Result<u64>;

    async fn transaction_count(&self, address: &Address) -> Result<u64>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash>;

    /// 阻塞直到交易获得一次确认。
    async fn wait_for_receipt(&self, hash: &TxHash) -> Result<Receipt>;

    /// 未知交易返回 `Ok(None)`。
    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<TransactionView>>;
}

// ==========================================
// JSON-RPC over HTTP
// ==========================================

/// 以太坊风格 JSON-RPC 节点 (Ganache / geth / anvil ...)。
pub struct HttpLedgerRpc {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// 一次调用失败的两种来源：传输层，或者节点明确返回的错误对象。
enum CallError {
    Transport(Error),
    Node(RpcErrorObject),
}

impl CallError {
    fn into_error(self, method: &str) -> Error {
        match self {
            CallError::Transport(e) => e,
            CallError::Node(obj) => Error::Protocol(format!("{method}: {} ({})", obj.message, obj.code)),
        }
    }
}

impl HttpLedgerRpc {
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
            poll_interval,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        debug!(method, id, "ledger rpc call");

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transport(Error::ConnectionUnavailable(format!("{}: {e}", self.url))))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CallError::Transport(Error::ConnectionUnavailable(format!(
                "{} answered HTTP {status}",
                self.url
            ))));
        }

        let parsed: RpcResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Transport(Error::Protocol(format!("{method}: unreadable response: {e}"))))?;

        match (parsed.error, parsed.result) {
            (Some(err), _) => Err(CallError::Node(err)),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl LedgerRpc for HttpLedgerRpc {
    async fn chain_id(&self) -> Result<u64> {
        let v = self
            .call("eth_chainId", json!([]))
            .await
            .map_err(|e| e.into_error("eth_chainId"))?;
        parse_quantity(&v)
    }

    async fn transaction_count(&self, address: &Address) -> Result<u64> {
        let v = self
            .call("eth_getTransactionCount", json!([address.to_string(), "latest"]))
            .await
            .map_err(|e| e.into_error("eth_getTransactionCount"))?;
        parse_quantity(&v)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash> {
        let encoded = format!("0x{}", hex::encode(raw));
        let v = self
            .call("eth_sendRawTransaction", json!([encoded]))
            .await
            .map_err(|e| match e {
                // 节点拒绝：nonce / gas / 签名
                CallError::Node(obj) => Error::TransactionRejected(obj.message),
                other => other.into_error("eth_sendRawTransaction"),
            })?;
        parse_hash(&v)
    }

    async fn wait_for_receipt(&self, hash: &TxHash) -> Result<Receipt> {
        loop {
            let v = self
                .call("eth_getTransactionReceipt", json!([hash.to_string()]))
                .await
                .map_err(|e| e.into_error("eth_getTransactionReceipt"))?;

            if !v.is_null() {
                return parse_receipt(&v);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<TransactionView>> {
        let v = match self.call("eth_getTransactionByHash", json!([hash.to_string()])).await {
            Ok(v) => v,
            // 节点对无法识别的哈希报错时，按“不存在”处理
            Err(CallError::Node(obj)) => {
                debug!(code = obj.code, message = %obj.message, "node rejected transaction lookup");
                return Ok(None);
            }
            Err(other) => return Err(other.into_error("eth_getTransactionByHash")),
        };
        if v.is_null() {
            return Ok(None);
        }
        parse_transaction(&v).map(Some)
    }
}

// ==========================================
// 响应解析
// ==========================================

fn field<'a>(v: &'a Value, name: &str) -> Result<&'a str> {
    v.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("missing field `{name}`")))
}

/// `0x`-前缀的十六进制数量。
pub fn parse_quantity(v: &Value) -> Result<u64> {
    let s = v
        .as_str()
        .ok_or_else(|| Error::Protocol(format!("expected hex quantity, got {v}")))?;
    let raw = s
        .strip_prefix("0x")
        .ok_or_else(|| Error::Protocol(format!("quantity {s:?} lacks 0x prefix")))?;
    if raw.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(raw, 16).map_err(|e| Error::Protocol(format!("quantity {s:?}: {e}")))
}

fn parse_hash(v: &Value) -> Result<TxHash> {
    v.as_str()
        .ok_or_else(|| Error::Protocol(format!("expected transaction hash, got {v}")))?
        .parse::<TxHash>()
        .map_err(Error::Protocol)
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(raw).map_err(|e| Error::Protocol(format!("invalid hex data: {e}")))
}

pub fn parse_receipt(v: &Value) -> Result<Receipt> {
    let transaction_hash = parse_hash(v.get("transactionHash").unwrap_or(&Value::Null))?;
    let block_number = parse_quantity(v.get("blockNumber").unwrap_or(&Value::Null))?;
    // 拜占庭分叉之前的节点没有 status 字段，视为成功
    let status = match v.get("status") {
        None | Some(Value::Null) => true,
        Some(s) => parse_quantity(s)? == 1,
    };
    Ok(Receipt {
        transaction_hash,
        block_number,
        status,
    })
}

pub fn parse_transaction(v: &Value) -> Result<TransactionView> {
    let block_number = match v.get("blockNumber") {
        None | Some(Value::Null) => None,
        Some(n) => Some(parse_quantity(n)?),
    };
    Ok(TransactionView {
        hash: parse_hash(v.get("hash").unwrap_or(&Value::Null))?,
        from: field(v, "from")?.parse::<Address>().map_err(Error::Protocol)?,
        nonce: parse_quantity(v.get("nonce").unwrap_or(&Value::Null))?,
        input: parse_hex_bytes(field(v, "input")?)?,
        block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), 26);
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), 0);
        assert!(parse_quantity(&json!("26")).is_err());
        assert!(parse_quantity(&json!(26)).is_err());
    }

    #[test]
    fn receipt_status() {
        let ok = json!({ "transactionHash": HASH, "blockNumber": "0x10", "status": "0x1" });
        let r = parse_receipt(&ok).unwrap();
        assert_eq!(r.block_number, 16);
        assert!(r.status);

        let failed = json!({ "transactionHash": HASH, "blockNumber": "0x10", "status": "0x0" });
        assert!(!parse_receipt(&failed).unwrap().status);
    }

    #[test]
    fn transaction_view_decodes_input() {
        let v = json!({
            "hash": HASH,
            "from": "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23",
            "nonce": "0x3",
            "blockNumber": null,
            "input": format!("0x{}", hex::encode("Image: a.png")),
        });
        let tx = parse_transaction(&v).unwrap();
        assert_eq!(tx.nonce, 3);
        assert_eq!(tx.block_number, None);
        assert_eq!(tx.input, b"Image: a.png");
        assert_eq!(tx.hash.to_string(), HASH);
    }

    #[test]
    fn empty_input_is_empty_bytes() {
        let v = json!({
            "hash": HASH,
            "from": "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23",
            "nonce": "0x0",
            "blockNumber": "0x1",
            "input": "0x",
        });
        assert!(parse_transaction(&v).unwrap().input.is_empty());
    }

    // ==========================================
    // 本地 JSON-RPC 桩节点
    // ==========================================

    use crate::fusion::Verdict;
    use crate::identity::LedgerIdentity;
    use crate::ledger::LedgerClient;
    use crate::provenance::ProvenanceRecord;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Arc;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    /// 收据前两次轮询返回 null，之后才出块。
    const PENDING_POLLS: u64 = 2;

    #[derive(Default)]
    struct StubNode {
        reject_sends: bool,
        receipt_polls: AtomicU64,
    }

    async fn answer(State(node): State<Arc<StubNode>>, Json(req): Json<Value>) -> Json<Value> {
        let params = &req["params"];
        let outcome: std::result::Result<Value, Value> = match req["method"].as_str().unwrap_or_default() {
            "eth_chainId" => Ok(json!("0x539")),
            "eth_getTransactionCount" => Ok(json!("0x0")),
            "eth_sendRawTransaction" if node.reject_sends => {
                Err(json!({ "code": -32000, "message": "nonce too low" }))
            }
            "eth_sendRawTransaction" => {
                let raw = params[0].as_str().unwrap_or_default().trim_start_matches("0x");
                Ok(json!(TxHash::of(&hex::decode(raw).unwrap()).to_string()))
            }
            "eth_getTransactionReceipt" => {
                if node.receipt_polls.fetch_add(1, Ordering::SeqCst) < PENDING_POLLS {
                    Ok(Value::Null)
                } else {
                    Ok(json!({ "transactionHash": params[0], "blockNumber": "0x7", "status": "0x1" }))
                }
            }
            "eth_getTransactionByHash" if params[0] == json!(format!("0x{}", "00".repeat(32))) => Ok(Value::Null),
            "eth_getTransactionByHash" => Err(json!({ "code": -32602, "message": "unknown transaction" })),
            other => Err(json!({ "code": -32601, "message": format!("method {other} not found") })),
        };
        Json(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": req["id"], "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": req["id"], "error": error }),
        })
    }

    /// 在随机端口起一个桩节点，返回根地址。`/down` 永远回 502。
    async fn spawn_node(node: Arc<StubNode>) -> String {
        let app = Router::new()
            .route("/", post(answer))
            .route("/down", post(|| async { StatusCode::BAD_GATEWAY }))
            .with_state(node);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn client_for(url: &str) -> LedgerClient {
        let identity = Arc::new(LedgerIdentity::from_hex(KEY).unwrap());
        LedgerClient::new(Arc::new(HttpLedgerRpc::new(url, Duration::from_millis(5))), identity)
    }

    fn record() -> ProvenanceRecord {
        ProvenanceRecord::new("a.png", "Resolution: 1x1\nHash: 00", Verdict::Authentic)
    }

    #[tokio::test]
    async fn node_error_on_send_is_transaction_rejected() {
        let url = spawn_node(Arc::new(StubNode {
            reject_sends: true,
            ..Default::default()
        }))
        .await;
        let err = client_for(&url).submit(&record()).await.unwrap_err();
        assert!(matches!(&err, Error::TransactionRejected(m) if m == "nonce too low"), "{err:?}");
    }

    #[tokio::test]
    async fn submit_polls_until_receipt_is_mined() {
        let node = Arc::new(StubNode::default());
        let url = spawn_node(node.clone()).await;

        let hash = client_for(&url).submit(&record()).await.unwrap();
        assert_eq!(hash.to_string().len(), 66);
        assert!(node.receipt_polls.load(Ordering::SeqCst) > PENDING_POLLS);
    }

    #[tokio::test]
    async fn lookup_errors_and_nulls_are_not_found() {
        let url = spawn_node(Arc::new(StubNode::default())).await;
        let client = client_for(&url);

        let unknown = format!("0x{}", "ab".repeat(32));
        assert!(matches!(client.fetch(&unknown).await, Err(Error::TransactionNotFound(_))));

        let zero = format!("0x{}", "00".repeat(32));
        assert!(matches!(client.fetch(&zero).await, Err(Error::TransactionNotFound(_))));
    }

    #[tokio::test]
    async fn non_success_status_is_connection_unavailable() {
        let url = spawn_node(Arc::new(StubNode::default())).await;
        let rpc = HttpLedgerRpc::new(format!("{url}/down"), Duration::from_millis(5));
        let err = rpc.chain_id().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable(_)), "{err:?}");

        let err = client_for(&format!("{url}/down")).submit(&record()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connection_unavailable() {
        // 端口 9 (discard) 通常无人监听
        let rpc = HttpLedgerRpc::new("http://127.0.0.1:9", Duration::from_millis(10));
        let err = rpc.chain_id().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable(_)), "{err:?}");
    }
}

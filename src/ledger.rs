use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::identity::{Address, LedgerIdentity};
use crate::provenance::{self, ProvenanceRecord};
use crate::rpc::LedgerRpc;
use crate::transaction::{LegacyTransaction, TxHash, DEFAULT_GAS_LIMIT, DEFAULT_GAS_PRICE_WEI};

/// 固定的 gas 策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPolicy {
    pub gas_limit: u64,
    pub gas_price_wei: u128,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            gas_limit: DEFAULT_GAS_LIMIT,
            gas_price_wei: DEFAULT_GAS_PRICE_WEI,
        }
    }
}

impl GasPolicy {
    pub fn from_gwei(gas_limit: u64, gas_price_gwei: u64) -> Self {
        Self {
            gas_limit,
            gas_price_wei: gas_price_gwei as u128 * 1_000_000_000,
        }
    }
}

/// 账本客户端 (Ledger Client)
///
/// - `submit`: 编码 → 取 nonce → 构造并签名交易 → 广播 → 等待一次确认。
/// - `fetch`: 按交易标识查回 data 字段并解码。
///
/// 两者都是纯粹的异步调用，只在网络等待处挂起；没有内部队列，独立提交之间的先后由调用方决定。
/// 同一账户并发提交可能拿到同一个 nonce，后到的一笔会被账本拒绝。
/// 任何失败都原样返回，从不自动重试。
pub struct LedgerClient {
    rpc: Arc<dyn LedgerRpc>,
    identity: Arc<LedgerIdentity>,
    gas: GasPolicy,
    chain_id: Option<u64>,
}

impl LedgerClient {
    pub fn new(rpc: Arc<dyn LedgerRpc>, identity: Arc<LedgerIdentity>) -> Self {
        Self {
            rpc,
            identity,
            gas: GasPolicy::default(),
            chain_id: None,
        }
    }

    pub fn with_gas_policy(mut self, gas: GasPolicy) -> Self {
        self.gas = gas;
        self
    }

    /// 开启 EIP-155 重放保护。
    pub fn with_chain_id(mut self, chain_id: Option<u64>) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn rpc(&self) -> &Arc<dyn LedgerRpc> {
        &self.rpc
    }

    /// 提交一条存证记录，返回交易标识。
    ///
    /// 一旦交易已经广播，取消这个 future 并不能撤回它，账本仍可能确认。
    pub async fn submit(&self, record: &ProvenanceRecord) -> Result<TxHash> {
        let payload = provenance::encode(record);
        let sender = self.identity.address();

        let nonce = self.rpc.transaction_count(&sender).await?;
        let tx = LegacyTransaction::self_addressed(
            sender,
            nonce,
            self.gas.gas_limit,
            self.gas.gas_price_wei,
            payload,
        );
        let signed = self.identity.sign(tx, self.chain_id)?;
        let local_hash = signed.hash();

        let hash = self.rpc.send_raw_transaction(&signed.raw()).await?;
        if hash != local_hash {
            warn!(%hash, %local_hash, "ledger reported a different transaction hash");
        }

        let receipt = self.rpc.wait_for_receipt(&hash).await?;
        if !receipt.status {
            return Err(Error::TransactionRejected(format!(
                "transaction {hash} failed in block {}",
                receipt.block_number
            )));
        }

        info!(%hash, nonce, block = receipt.block_number, verdict = %record.verdict, "provenance recorded");
        Ok(hash)
    }

    /// 按标识取回存证文本。
    ///
    /// 标识格式错误或账本上不存在 → `TransactionNotFound`；
    /// 存在但 data 为空 → `NoProvenanceData`；data 不是 UTF-8 → `MalformedPayload`。
    pub async fn fetch(&self, transaction_id: &str) -> Result<String> {
        let hash: TxHash = transaction_id
            .trim()
            .parse()
            .map_err(|_| Error::TransactionNotFound(transaction_id.to_string()))?;

        let tx = self
            .rpc
            .get_transaction(&hash)
            .await?
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

        if tx.input.is_empty() {
            return Err(Error::NoProvenanceData(hash.to_string()));
        }
        provenance::decode(&tx.input)
    }
}

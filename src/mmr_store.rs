use async_trait::async_trait;
use ckb_merkle_mountain_range::{util::MemStore, Merge, MerkleProof, MMR};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::Address;
use crate::rpc::{LedgerRpc, Receipt, TransactionView};
use crate::transaction::{SignedTransaction, TxHash};

/// 模块：进程内开发账本 (Memory Ledger)
///
/// **职责**: 在没有外部节点时充当账本，实现与真实节点相同的 `LedgerRpc` 接口。
/// 它会真的校验每笔交易：解码原始字节、从签名恢复发送方、检查 nonce 与固有 gas。
/// 每笔被接受的交易单独成块，同时把原始字节的指纹追加进一棵 Merkle Mountain Range，
/// 因此可以对任意交易开具“存在于当前账本根之下”的证明。
///
/// **不落盘**: 进程退出即清空，仅用于开发与测试。不处理余额与手续费扣除。

/// 单个区块允许的最大 gas。
pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;

/// Ganache 默认链 id。
pub const DEFAULT_CHAIN_ID: u64 = 1337;

/// 合并策略：父节点 = BLAKE3(左 || 右)。
pub struct MergeBlake3;

impl Merge for MergeBlake3 {
    type Item = [u8; 32];

    fn merge(lhs: &Self::Item, rhs: &Self::Item) -> ckb_merkle_mountain_range::Result<Self::Item> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(lhs);
        hasher.update(rhs);
        Ok(*hasher.finalize().as_bytes())
    }
}

/// MMR 叶子：签名交易原始字节的 BLAKE3。
pub fn leaf_hash(raw_tx: &[u8]) -> [u8; 32] {
    *blake3::hash(raw_tx).as_bytes()
}

/// 交易包含证明。持有原始交易字节的任何人都可以独立验证。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub root: [u8; 32],
    pub mmr_size: u64,
    pub leaf_pos: u64,
    pub items: Vec<[u8; 32]>,
}

impl InclusionProof {
    pub fn verify(&self, raw_tx: &[u8]) -> bool {
        let proof = MerkleProof::<[u8; 32], MergeBlake3>::new(self.mmr_size, self.items.clone());
        proof
            .verify(self.root, vec![(self.leaf_pos, leaf_hash(raw_tx))])
            .unwrap_or(false)
    }
}

struct StoredTx {
    signed: SignedTransaction,
    raw: Vec<u8>,
    from: Address,
    block_number: u64,
    leaf_pos: u64,
}

struct LedgerState {
    /// MMR 节点存储 + 当前大小 (位运算路由的坐标系，丢了就无法定位山峰)
    store: MemStore<[u8; 32]>,
    mmr_size: u64,
    root: Option<[u8; 32]>,
    height: u64,
    nonces: HashMap<Address, u64>,
    transactions: HashMap<TxHash, StoredTx>,
}

pub struct MemoryLedger {
    chain_id: u64,
    state: Mutex<LedgerState>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CHAIN_ID)
    }
}

impl MemoryLedger {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(LedgerState {
                store: MemStore::default(),
                mmr_size: 0,
                root: None,
                height: 0,
                nonces: HashMap::new(),
                transactions: HashMap::new(),
            }),
        }
    }

    /// 当前账本根；空账本为 `None`。
    pub async fn root(&self) -> Option<[u8; 32]> {
        self.state.lock().await.root
    }

    pub async fn height(&self) -> u64 {
        self.state.lock().await.height
    }

    /// 针对当前根开具包含证明。
    pub async fn inclusion_proof(&self, hash: &TxHash) -> Result<InclusionProof> {
        let state = self.state.lock().await;
        let stored = state
            .transactions
            .get(hash)
            .ok_or_else(|| Error::TransactionNotFound(hash.to_string()))?;

        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(state.mmr_size, &state.store);
        let proof = mmr
            .gen_proof(vec![stored.leaf_pos])
            .map_err(|e| Error::Protocol(format!("mmr gen_proof: {e}")))?;
        let root = mmr
            .get_root()
            .map_err(|e| Error::Protocol(format!("mmr get_root: {e}")))?;

        Ok(InclusionProof {
            root,
            mmr_size: state.mmr_size,
            leaf_pos: stored.leaf_pos,
            items: proof.proof_items().to_vec(),
        })
    }

    /// 原始交易字节 (给证明验证方)。
    pub async fn raw_transaction(&self, hash: &TxHash) -> Option<Vec<u8>> {
        self.state.lock().await.transactions.get(hash).map(|t| t.raw.clone())
    }

    fn admit(&self, raw: &[u8], state: &LedgerState) -> Result<(SignedTransaction, Address)> {
        let signed = SignedTransaction::decode(raw)
            .map_err(|e| Error::TransactionRejected(format!("invalid transaction encoding: {e}")))?;

        if let Some(id) = signed.chain_id() {
            if id != self.chain_id {
                return Err(Error::TransactionRejected(format!(
                    "invalid chain id {id}, expected {}",
                    self.chain_id
                )));
            }
        }

        let from = signed
            .recover_sender()
            .map_err(|e| Error::TransactionRejected(format!("invalid signature: {e}")))?;

        let expected = state.nonces.get(&from).copied().unwrap_or(0);
        if signed.tx.nonce < expected {
            return Err(Error::TransactionRejected(format!(
                "nonce too low: got {}, expected {expected}",
                signed.tx.nonce
            )));
        }
        if signed.tx.nonce > expected {
            return Err(Error::TransactionRejected(format!(
                "nonce too high: got {}, expected {expected}",
                signed.tx.nonce
            )));
        }

        let intrinsic = signed.tx.intrinsic_gas();
        if signed.tx.gas_limit < intrinsic {
            return Err(Error::TransactionRejected(format!(
                "intrinsic gas too low: have {}, want {intrinsic}",
                signed.tx.gas_limit
            )));
        }
        if signed.tx.gas_limit > BLOCK_GAS_LIMIT {
            return Err(Error::TransactionRejected("exceeds block gas limit".into()));
        }

        Ok((signed, from))
    }
}

#[async_trait]
impl LedgerRpc for MemoryLedger {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn transaction_count(&self, address: &Address) -> Result<u64> {
        Ok(self.state.lock().await.nonces.get(address).copied().unwrap_or(0))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let hash = TxHash::of(raw);
        if state.transactions.contains_key(&hash) {
            return Err(Error::TransactionRejected(format!("already known: {hash}")));
        }
        let (signed, from) = self.admit(raw, state)?;

        // 追加叶子：O(log n) 次合并，只增不改
        let mut mmr = MMR::<[u8; 32], MergeBlake3, _>::new(state.mmr_size, &state.store);
        let leaf_pos = mmr
            .push(leaf_hash(raw))
            .map_err(|e| Error::Protocol(format!("mmr append: {e}")))?;
        let root = mmr
            .get_root()
            .map_err(|e| Error::Protocol(format!("mmr get_root: {e}")))?;
        let mmr_size = mmr.mmr_size();
        mmr.commit()
            .map_err(|e| Error::Protocol(format!("mmr commit: {e}")))?;

        state.mmr_size = mmr_size;
        state.root = Some(root);
        state.height += 1;
        *state.nonces.entry(from).or_insert(0) += 1;

        let block_number = state.height;
        state.transactions.insert(
            hash,
            StoredTx {
                signed,
                raw: raw.to_vec(),
                from,
                block_number,
                leaf_pos,
            },
        );

        info!(%hash, %from, block_number, root = %hex::encode(root), "memory ledger accepted transaction");
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: &TxHash) -> Result<Receipt> {
        // 每笔交易即时出块，无需轮询
        let state = self.state.lock().await;
        let stored = state
            .transactions
            .get(hash)
            .ok_or_else(|| Error::TransactionNotFound(hash.to_string()))?;
        Ok(Receipt {
            transaction_hash: *hash,
            block_number: stored.block_number,
            status: true,
        })
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<TransactionView>> {
        let state = self.state.lock().await;
        debug!(%hash, "memory ledger lookup");
        Ok(state.transactions.get(hash).map(|stored| TransactionView {
            hash: *hash,
            from: stored.from,
            nonce: stored.signed.tx.nonce,
            input: stored.signed.tx.data.clone(),
            block_number: Some(stored.block_number),
        }))
    }
}

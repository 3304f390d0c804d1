use k256::ecdsa::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::transaction::{LegacyTransaction, SignedTransaction};

/// 20 字节账户地址。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    /// 地址 = keccak256(未压缩公钥去掉 0x04 前缀) 的后 20 字节。
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let digest = Keccak256::digest(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| format!("invalid address {s:?}: {e}"))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| format!("address {s:?} is not 20 bytes"))?;
        Ok(Address(arr))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

/// 账本身份 (Ledger Identity)
///
/// 私钥 + 地址，进程启动时加载一次，此后只读。构造 `LedgerClient` 时显式传入，
/// 不做任何全局可变状态。本模块不生成、也不轮换密钥。
pub struct LedgerIdentity {
    key: SigningKey,
    address: Address,
}

impl LedgerIdentity {
    /// 从十六进制私钥加载 (可带 `0x` 前缀)。
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let raw = private_key.trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes =
            hex::decode(raw).map_err(|e| Error::InvalidIdentity(format!("private key is not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|e| Error::InvalidIdentity(format!("invalid secp256k1 key: {e}")))?;
        let address = Address::from_verifying_key(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// 公钥 (给外部验签方)。
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }

    /// 签名协作方：对交易做可恢复签名。
    /// `chain_id` 为 `Some` 时按 EIP-155 做重放保护，`None` 时是传统签名 (v = 27/28)。
    pub fn sign(&self, tx: LegacyTransaction, chain_id: Option<u64>) -> Result<SignedTransaction> {
        let hash = tx.signing_hash(chain_id);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| Error::TransactionRejected(format!("signing failed: {e}")))?;

        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);

        let parity = recovery_id.to_byte() as u64;
        let v = match chain_id {
            Some(id) => id * 2 + 35 + parity,
            None => 27 + parity,
        };
        Ok(SignedTransaction { tx, v, r, s })
    }
}

impl fmt::Debug for LedgerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerIdentity")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

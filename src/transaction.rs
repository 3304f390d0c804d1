use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

use crate::identity::Address;

/// 固定 gas 策略下的默认值。
pub const DEFAULT_GAS_LIMIT: u64 = 2_000_000;
pub const DEFAULT_GAS_PRICE_WEI: u128 = 20_000_000_000; // 20 gwei

/// 交易标识：签名后原始字节的 keccak256。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn of(raw: &[u8]) -> Self {
        TxHash(keccak256(raw))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

/// 只接受 `0x` + 64 位十六进制。
impl FromStr for TxHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("transaction id {s:?} must start with 0x"))?;
        if raw.len() != 64 {
            return Err(format!("transaction id {s:?} must be 32 bytes"));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(raw, &mut out).map_err(|e| format!("transaction id {s:?}: {e}"))?;
        Ok(TxHash(out))
    }
}

impl TryFrom<String> for TxHash {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TxHash> for String {
    fn from(h: TxHash) -> String {
        h.to_string()
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// 传统 (type-0) 交易。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    /// 发给自己、转账金额为 0，仅用来携带 data。
    pub fn self_addressed(sender: Address, nonce: u64, gas_limit: u64, gas_price: u128, data: Vec<u8>) -> Self {
        Self {
            nonce,
            gas_price,
            gas_limit,
            to: sender,
            value: 0,
            data,
        }
    }

    fn base_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp::uint(self.nonce as u128),
            rlp::uint(self.gas_price),
            rlp::uint(self.gas_limit as u128),
            rlp::bytes(&self.to.0),
            rlp::uint(self.value),
            rlp::bytes(&self.data),
        ]
    }

    /// 签名原文的哈希。EIP-155 下额外拼接 (chain_id, 0, 0)。
    pub fn signing_hash(&self, chain_id: Option<u64>) -> [u8; 32] {
        let mut fields = self.base_fields();
        if let Some(id) = chain_id {
            fields.push(rlp::uint(id as u128));
            fields.push(rlp::uint(0));
            fields.push(rlp::uint(0));
        }
        keccak256(&rlp::list(&fields))
    }

    /// 固有 gas：21000 + 每个零字节 4 + 每个非零字节 16。
    pub fn intrinsic_gas(&self) -> u64 {
        let zeros = self.data.iter().filter(|&&b| b == 0).count() as u64;
        let non_zeros = self.data.len() as u64 - zeros;
        21_000 + zeros * 4 + non_zeros * 16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: LegacyTransaction,
    pub v: u64,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl SignedTransaction {
    /// 可直接 `sendRawTransaction` 的 RLP 字节。
    pub fn raw(&self) -> Vec<u8> {
        let mut fields = self.tx.base_fields();
        fields.push(rlp::uint(self.v as u128));
        fields.push(rlp::bytes(rlp::trim_leading_zeros(&self.r)));
        fields.push(rlp::bytes(rlp::trim_leading_zeros(&self.s)));
        rlp::list(&fields)
    }

    pub fn hash(&self) -> TxHash {
        TxHash::of(&self.raw())
    }

    /// v 中携带的链 id；传统签名返回 `None`。
    pub fn chain_id(&self) -> Option<u64> {
        if self.v >= 35 {
            Some((self.v - 35) / 2)
        } else {
            None
        }
    }

    /// 从原始字节还原。
    pub fn decode(raw: &[u8]) -> Result<Self, String> {
        let items = rlp::decode_list(raw)?;
        if items.len() != 9 {
            return Err(format!("expected 9 transaction fields, found {}", items.len()));
        }
        let to: [u8; 20] = items[3]
            .as_slice()
            .try_into()
            .map_err(|_| "recipient must be 20 bytes".to_string())?;

        Ok(Self {
            tx: LegacyTransaction {
                nonce: rlp::to_u64(&items[0])?,
                gas_price: rlp::to_u128(&items[1])?,
                gas_limit: rlp::to_u64(&items[2])?,
                to: Address(to),
                value: rlp::to_u128(&items[4])?,
                data: items[5].clone(),
            },
            v: rlp::to_u64(&items[6])?,
            r: rlp::left_pad_32(&items[7])?,
            s: rlp::left_pad_32(&items[8])?,
        })
    }

    /// 由签名恢复发送方地址。
    pub fn recover_sender(&self) -> Result<Address, String> {
        let parity = match self.chain_id() {
            Some(_) => (self.v - 35) % 2,
            None if self.v == 27 || self.v == 28 => self.v - 27,
            None => return Err(format!("invalid signature v = {}", self.v)),
        };
        let recovery_id =
            RecoveryId::from_byte(parity as u8).ok_or_else(|| "invalid recovery id".to_string())?;

        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&self.r);
        rs[32..].copy_from_slice(&self.s);
        let signature = Signature::from_slice(&rs).map_err(|e| format!("invalid signature: {e}"))?;

        let hash = self.tx.signing_hash(self.chain_id());
        let key = VerifyingKey::recover_from_prehash(&hash, &signature, recovery_id)
            .map_err(|e| format!("signature recovery failed: {e}"))?;
        Ok(Address::from_verifying_key(&key))
    }
}

/// 最小 RLP 编解码：只覆盖传统交易用到的字节串与一层列表。
mod rlp {
    pub fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        &bytes[first..]
    }

    fn length_header(len: usize, offset: u8) -> Vec<u8> {
        if len < 56 {
            vec![offset + len as u8]
        } else {
            let be = (len as u64).to_be_bytes();
            let len_bytes = trim_leading_zeros(&be);
            let mut out = vec![offset + 55 + len_bytes.len() as u8];
            out.extend_from_slice(len_bytes);
            out
        }
    }

    pub fn bytes(data: &[u8]) -> Vec<u8> {
        if data.len() == 1 && data[0] < 0x80 {
            return vec![data[0]];
        }
        let mut out = length_header(data.len(), 0x80);
        out.extend_from_slice(data);
        out
    }

    /// 整数按最短大端编码，0 编成空串。
    pub fn uint(v: u128) -> Vec<u8> {
        bytes(trim_leading_zeros(&v.to_be_bytes()))
    }

    pub fn list(items: &[Vec<u8>]) -> Vec<u8> {
        let payload: Vec<u8> = items.concat();
        let mut out = length_header(payload.len(), 0xc0);
        out.extend_from_slice(&payload);
        out
    }

    fn read_len(buf: &[u8], n: usize) -> Result<usize, String> {
        if n == 0 || n > 8 || buf.len() < n {
            return Err("truncated rlp length".into());
        }
        Ok(buf[..n].iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
    }

    // 返回 (是否列表, 内容起点, 内容长度)
    fn header(buf: &[u8]) -> Result<(bool, usize, usize), String> {
        let first = *buf.first().ok_or("empty rlp item")?;
        let (is_list, start, len) = match first {
            0x00..=0x7f => (false, 0, 1),
            0x80..=0xb7 => (false, 1, (first - 0x80) as usize),
            0xb8..=0xbf => {
                let n = (first - 0xb7) as usize;
                (false, 1 + n, read_len(&buf[1..], n)?)
            }
            0xc0..=0xf7 => (true, 1, (first - 0xc0) as usize),
            0xf8..=0xff => {
                let n = (first - 0xf7) as usize;
                (true, 1 + n, read_len(&buf[1..], n)?)
            }
        };
        if start.checked_add(len).map_or(true, |end| end > buf.len()) {
            return Err("rlp item overruns buffer".into());
        }
        Ok((is_list, start, len))
    }

    /// 解一层列表，元素必须都是字节串。
    pub fn decode_list(buf: &[u8]) -> Result<Vec<Vec<u8>>, String> {
        let (is_list, start, len) = header(buf)?;
        if !is_list {
            return Err("expected rlp list".into());
        }
        if start + len != buf.len() {
            return Err("trailing bytes after rlp list".into());
        }

        let mut items = Vec::new();
        let mut rest = &buf[start..start + len];
        while !rest.is_empty() {
            let (nested, s, l) = header(rest)?;
            if nested {
                return Err("unexpected nested rlp list".into());
            }
            items.push(rest[s..s + l].to_vec());
            rest = &rest[s + l..];
        }
        Ok(items)
    }

    pub fn to_u128(bytes: &[u8]) -> Result<u128, String> {
        if bytes.len() > 16 {
            return Err("integer field too large".into());
        }
        Ok(bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128))
    }

    pub fn to_u64(bytes: &[u8]) -> Result<u64, String> {
        if bytes.len() > 8 {
            return Err("integer field too large".into());
        }
        Ok(to_u128(bytes)? as u64)
    }

    pub fn left_pad_32(bytes: &[u8]) -> Result<[u8; 32], String> {
        if bytes.len() > 32 {
            return Err("signature component too large".into());
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(bytes);
        Ok(out)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LedgerIdentity;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn sample(id: &LedgerIdentity) -> LegacyTransaction {
        LegacyTransaction::self_addressed(
            id.address(),
            7,
            DEFAULT_GAS_LIMIT,
            DEFAULT_GAS_PRICE_WEI,
            b"Image: a.png, Metadata: m, Tampering Result: Authentic".to_vec(),
        )
    }

    #[test]
    fn eip155_reference_vector() {
        // EIP-155 规范中的示例交易
        let key = "4646464646464646464646464646464646464646464646464646464646464646";
        let id = LedgerIdentity::from_hex(key).unwrap();
        let tx = LegacyTransaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: 1_000_000_000_000_000_000,
            data: Vec::new(),
        };
        assert_eq!(
            hex::encode(tx.signing_hash(Some(1))),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
        let signed = id.sign(tx, Some(1)).unwrap();
        assert_eq!(
            hex::encode(signed.raw()),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn raw_roundtrip_and_sender_recovery() {
        let id = LedgerIdentity::from_hex(KEY).unwrap();
        for chain in [None, Some(1337)] {
            let signed = id.sign(sample(&id), chain).unwrap();
            let decoded = SignedTransaction::decode(&signed.raw()).unwrap();
            assert_eq!(decoded, signed);
            assert_eq!(decoded.recover_sender().unwrap(), id.address());
            assert_eq!(decoded.chain_id(), chain);
        }
    }

    #[test]
    fn tampered_payload_recovers_different_sender() {
        let id = LedgerIdentity::from_hex(KEY).unwrap();
        let mut signed = id.sign(sample(&id), Some(1337)).unwrap();
        signed.tx.data = b"Image: forged.png".to_vec();
        if let Ok(addr) = signed.recover_sender() {
            assert_ne!(addr, id.address());
        }
    }

    #[test]
    fn intrinsic_gas_counts_bytes() {
        let id = LedgerIdentity::from_hex(KEY).unwrap();
        let mut tx = sample(&id);
        tx.data = vec![0, 0, 1];
        assert_eq!(tx.intrinsic_gas(), 21_000 + 4 + 4 + 16);
    }

    #[test]
    fn tx_hash_parsing_is_strict() {
        let ok = format!("0x{}", "ab".repeat(32));
        assert_eq!(ok.parse::<TxHash>().unwrap().to_string(), ok);
        assert!("0xdeadbeef".parse::<TxHash>().is_err());
        assert!("ab".repeat(32).parse::<TxHash>().is_err());
        assert!(format!("0x{}", "zz".repeat(32)).parse::<TxHash>().is_err());
    }
}

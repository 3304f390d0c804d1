use anyhow::{bail, Context};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 账本后端。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    /// 外部 JSON-RPC 节点。
    Http { url: String },
    /// 进程内开发账本 (不持久化)。
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ledger: LedgerBackend,
    pub private_key: String,
    pub chain_id: Option<u64>,
    pub gas_limit: u64,
    pub gas_price_gwei: u64,
    pub receipt_poll: Duration,
    pub classifier_url: String,
    pub noise_threshold: f64,
    pub ela_quality: u8,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源读取，便于测试。
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let ledger = match get("LEDGER_BACKEND").as_deref().unwrap_or("http") {
            "http" => LedgerBackend::Http {
                url: get("LEDGER_RPC_URL").unwrap_or_else(|| "http://127.0.0.1:7545".to_string()),
            },
            "memory" => LedgerBackend::Memory,
            other => bail!("LEDGER_BACKEND must be `http` or `memory`, got {other:?}"),
        };

        let private_key = get("LEDGER_PRIVATE_KEY").context("LEDGER_PRIVATE_KEY must be set")?;
        let classifier_url = get("CLASSIFIER_URL").context("CLASSIFIER_URL must be set")?;

        let ela_quality: u8 = parse_or(&get, "ELA_QUALITY", 90)?;
        if !(1..=100).contains(&ela_quality) {
            bail!("ELA_QUALITY must be within 1..=100, got {ela_quality}");
        }

        let noise_threshold: f64 = parse_or(&get, "NOISE_THRESHOLD", 100.0)?;
        if !noise_threshold.is_finite() {
            bail!("NOISE_THRESHOLD must be a finite number, got {noise_threshold}");
        }

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "PORT", 3000)?,
            ledger,
            private_key,
            chain_id: get("CHAIN_ID")
                .map(|v| v.parse::<u64>().with_context(|| format!("CHAIN_ID must be a number, got {v:?}")))
                .transpose()?,
            gas_limit: parse_or(&get, "GAS_LIMIT", 2_000_000)?,
            gas_price_gwei: parse_or(&get, "GAS_PRICE_GWEI", 20)?,
            receipt_poll: Duration::from_millis(parse_or(&get, "RECEIPT_POLL_MS", 100)?),
            classifier_url,
            noise_threshold,
            ela_quality,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value {raw:?}")),
        None => Ok(default),
    }
}

// 私钥永远不进日志
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ledger", &self.ledger)
            .field("private_key", &"<redacted>")
            .field("chain_id", &self.chain_id)
            .field("gas_limit", &self.gas_limit)
            .field("gas_price_gwei", &self.gas_price_gwei)
            .field("receipt_poll", &self.receipt_poll)
            .field("classifier_url", &self.classifier_url)
            .field("noise_threshold", &self.noise_threshold)
            .field("ela_quality", &self.ela_quality)
            .finish()
    }
}

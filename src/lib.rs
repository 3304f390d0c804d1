//! 原镜 (Yuanjing) 图片篡改检测与账本存证。
//!
//! 一张图片进来，经过指纹、四路取证分析和融合判定，最后把一条纯文本存证写进以太坊风格账本，
//! 任何人都能按交易标识查回。

pub mod api;
pub mod classifier;
pub mod config;
pub mod decoded;
pub mod error;
pub mod fingerprint;
pub mod forensics;
pub mod fusion;
pub mod identity;
pub mod ledger;
pub mod mmr_store;
pub mod pipeline;
pub mod provenance;
pub mod rpc;
pub mod transaction;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 默认噪声下限：拉普拉斯方差低于它即视为取证信号触发。
pub const DEFAULT_NOISE_THRESHOLD: f64 = 100.0;

/// 分类器概率高于它即视为分类器信号触发。
pub const PROBABILITY_THRESHOLD: f64 = 0.5;

/// 最终判定。每条 ImageRecord 只产生一次，之后不可变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Authentic,
    Tampered,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Authentic => "Authentic",
            Verdict::Tampered => "Tampered",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authentic" => Ok(Verdict::Authentic),
            "Tampered" => Ok(Verdict::Tampered),
            other => Err(format!("unknown verdict {other:?}")),
        }
    }
}

/// 融合策略 (Fusion Policy)
///
/// 高召回、容忍误报：两个信号是 **或** 关系，任意一个触发就判定为篡改，不做加权或平均。
/// 宁可多报，也不漏掉篡改。
///
/// ELA 残差和 DCT 系数会被计算并展示，但不参与自动判定。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionPolicy {
    pub noise_threshold: f64,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            noise_threshold: DEFAULT_NOISE_THRESHOLD,
        }
    }
}

impl FusionPolicy {
    pub fn new(noise_threshold: f64) -> Self {
        Self { noise_threshold }
    }

    /// 两个阈值都是严格不等式：概率恰为 0.5、方差恰为阈值时判定为 Authentic。
    pub fn fuse(&self, probability: f64, noise_variance: f64) -> Verdict {
        let forensic_flag = noise_variance < self.noise_threshold;
        let classifier_flag = probability > PROBABILITY_THRESHOLD;
        if classifier_flag || forensic_flag {
            Verdict::Tampered
        } else {
            Verdict::Authentic
        }
    }
}

/// 默认策略下的融合。
pub fn fuse(probability: f64, noise_variance: f64) -> Verdict {
    FusionPolicy::default().fuse(probability, noise_variance)
}

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::ImageRecord;
use crate::fusion::Verdict;

/// 存证记录 (Provenance Record)
///
/// 账本上保存的最小单元：图片标识 + 元数据摘要 + 判定。
/// 编码成一段纯 UTF-8 文本放进交易的 data 字段，字段顺序固定：
///
/// ```text
/// Image: <标识>, Metadata: <摘要>, Tampering Result: <判定>
/// ```
///
/// 没有任何二进制封装。任何拿到交易原始数据的第三方，只要做一次 UTF-8 解码就能读出内容，
/// 不需要本系统的代码。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub image_identifier: String,
    pub metadata_summary: String,
    pub verdict: Verdict,
}

const IMAGE_PREFIX: &str = "Image: ";
const METADATA_SEP: &str = ", Metadata: ";
const VERDICT_SEP: &str = ", Tampering Result: ";

impl ProvenanceRecord {
    pub fn new(
        image_identifier: impl Into<String>,
        metadata_summary: impl Into<String>,
        verdict: Verdict,
    ) -> Self {
        Self {
            image_identifier: image_identifier.into(),
            metadata_summary: metadata_summary.into(),
            verdict,
        }
    }

    /// 由分析结果构造：标识取源路径，摘要取 ImageRecord 的固定格式摘要。
    pub fn from_image(record: &ImageRecord, verdict: Verdict) -> Self {
        Self::new(record.source_path.clone(), record.metadata_summary(), verdict)
    }

    /// 确定性的文本形式。
    pub fn to_text(&self) -> String {
        format!(
            "{IMAGE_PREFIX}{}{METADATA_SEP}{}{VERDICT_SEP}{}",
            self.image_identifier, self.metadata_summary, self.verdict
        )
    }
}

/// 记录 → 交易 data 字节。
pub fn encode(record: &ProvenanceRecord) -> Vec<u8> {
    record.to_text().into_bytes()
}

/// 交易 data 字节 → 原样文本。只有不是合法 UTF-8 时才失败。
pub fn decode(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::MalformedPayload(e.to_string()))
}

/// 把取回的文本重新拆成三个字段。
///
/// 判定取最后一个 `, Tampering Result: ` 之后的部分，标识取第一个 `, Metadata: ` 之前的部分，
/// 所以摘要里出现逗号不影响解析。
pub fn parse(text: &str) -> Result<ProvenanceRecord> {
    let rest = text
        .strip_prefix(IMAGE_PREFIX)
        .ok_or_else(|| Error::MalformedPayload("missing `Image:` field".into()))?;

    let (head, verdict) = rest
        .rsplit_once(VERDICT_SEP)
        .ok_or_else(|| Error::MalformedPayload("missing `Tampering Result:` field".into()))?;

    let (identifier, summary) = head
        .split_once(METADATA_SEP)
        .ok_or_else(|| Error::MalformedPayload("missing `Metadata:` field".into()))?;

    let verdict = verdict.parse::<Verdict>().map_err(Error::MalformedPayload)?;
    Ok(ProvenanceRecord::new(identifier, summary, verdict))
}

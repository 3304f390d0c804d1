use thiserror::Error;

/// 错误分类 (Error Taxonomy)
///
/// 每一种失败都在流水线边界被捕获并转成调用方可见的值。
/// 任何变体都不会被自动重试：基于 nonce 的账本上盲目重发只会制造乱序或重复提交。
#[derive(Debug, Error)]
pub enum Error {
    /// 文件不存在 / 损坏 / 无法解码。对本次提交是致命的。
    #[error("unreadable image {path}: {reason}")]
    UnreadableImage { path: String, reason: String },

    /// 账本节点不可达，调用方可以手动重试。
    #[error("ledger endpoint unavailable: {0}")]
    ConnectionUnavailable(String),

    /// nonce / gas / 签名问题，附带节点给出的原因。
    #[error("transaction rejected: {0}")]
    TransactionRejected(String),

    /// 交易存在，但 data 字段不是合法 UTF-8。
    #[error("malformed provenance payload: {0}")]
    MalformedPayload(String),

    /// 交易存在，但没有携带任何数据。
    #[error("transaction {0} carries no provenance data")]
    NoProvenanceData(String),

    /// 交易标识未知或格式错误。
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("classifier failure: {0}")]
    Classifier(String),

    #[error("invalid ledger identity: {0}")]
    InvalidIdentity(String),

    /// 节点回了东西，但不是合法的 RPC 响应。
    #[error("ledger protocol error: {0}")]
    Protocol(String),

    /// 工作线程 panic 或被取消。
    #[error("analysis task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn unreadable(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::UnreadableImage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// 把内存缓冲上的解码失败归到具体的源文件；其他变体原样返回。
    pub fn at_path(self, path: impl Into<String>) -> Self {
        match self {
            Self::UnreadableImage { reason, .. } => Self::UnreadableImage {
                path: path.into(),
                reason,
            },
            other => other,
        }
    }

    /// 稳定的机器可读错误码，HTTP 层直接透出。
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnreadableImage { .. } => "UNREADABLE_IMAGE",
            Self::ConnectionUnavailable(_) => "CONNECTION_UNAVAILABLE",
            Self::TransactionRejected(_) => "TRANSACTION_REJECTED",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::NoProvenanceData(_) => "NO_PROVENANCE_DATA",
            Self::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Self::Classifier(_) => "CLASSIFIER_FAILURE",
            Self::InvalidIdentity(_) => "INVALID_IDENTITY",
            Self::Protocol(_) => "LEDGER_PROTOCOL_ERROR",
            Self::Task(_) => "TASK_FAILED",
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_errors_have_distinct_codes() {
        let codes = [
            Error::MalformedPayload("x".into()).code(),
            Error::NoProvenanceData("x".into()).code(),
            Error::TransactionNotFound("x".into()).code(),
        ];
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[0], codes[2]);
    }

    #[test]
    fn unreadable_message_names_the_path() {
        let e = Error::unreadable("/tmp/a.png", "no such file");
        assert_eq!(e.to_string(), "unreadable image /tmp/a.png: no such file");
    }

    #[test]
    fn at_path_rebinds_only_unreadable_images() {
        let e = Error::unreadable("<in-memory>", "jpeg re-encode: too wide").at_path("/photos/pano.png");
        assert!(matches!(
            &e,
            Error::UnreadableImage { path, reason } if path == "/photos/pano.png" && reason == "jpeg re-encode: too wide"
        ));

        let other = Error::Classifier("down".into()).at_path("/photos/pano.png");
        assert!(matches!(other, Error::Classifier(m) if m == "down"));
    }
}

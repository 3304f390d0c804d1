use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::Error;
use crate::fusion::Verdict;
use crate::ledger::LedgerClient;
use crate::pipeline::{ForensicPipeline, TracingProgress};
use crate::provenance::{self, ProvenanceRecord};

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 流水线与账本客户端都是只读共享，内部没有需要加锁的可变状态。
pub struct AppState {
    pub pipeline: Arc<ForensicPipeline>,
    pub ledger: Arc<LedgerClient>,
}

// ==========================================
// 2. 数据传输对象 (DTOs)
// ==========================================

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub image_path: String,
}

/// 分析 + 上链回执。
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub tx_id: String,
    pub verdict: Verdict,
    pub probability: f64,
    pub noise_variance: f64,
    pub ela_mean_residue: f64,
    pub dct_high_frequency_ratio: f64,
    pub content_hash: String,
    pub payload: String,
}

/// 取回的存证。文本符合固定布局时附带解析后的字段。
#[derive(Debug, Serialize, Deserialize)]
pub struct RetrievedProvenance {
    pub tx_id: String,
    pub payload: String,
    pub record: Option<ProvenanceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub ledger_reachable: bool,
    pub chain_id: Option<u64>,
    pub signer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::UnreadableImage { .. } => StatusCode::BAD_REQUEST,
        Error::TransactionNotFound(_) | Error::NoProvenanceData(_) => StatusCode::NOT_FOUND,
        Error::MalformedPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::TransactionRejected(_) => StatusCode::CONFLICT,
        Error::ConnectionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Classifier(_) | Error::Protocol(_) => StatusCode::BAD_GATEWAY,
        Error::InvalidIdentity(_) | Error::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: Error) -> ApiError {
    let status = status_of(&err);
    warn!(code = err.code(), %err, "request failed");
    (
        status,
        Json(ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}

// ==========================================
// 3. 路由
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/provenance", post(submit_provenance))
        .route("/provenance/{tx_id}", get(fetch_provenance))
        .route("/health", get(health))
        .layer(CorsLayer::permissive()) // 开发模式：允许所有跨域
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

/// 分析一张本地图片并把结论写上账本。
pub async fn submit_provenance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<SubmissionReceipt>, ApiError> {
    info!(image = %req.image_path, "📥 provenance request");

    let analysis = state
        .pipeline
        .analyze(std::path::Path::new(&req.image_path), &TracingProgress)
        .await
        .map_err(reject)?;

    let record = analysis.provenance();
    let tx_id = state.ledger.submit(&record).await.map_err(reject)?;

    Ok(Json(SubmissionReceipt {
        tx_id: tx_id.to_string(),
        verdict: analysis.verdict,
        probability: analysis.probability,
        noise_variance: analysis.signals.noise_variance,
        ela_mean_residue: analysis.signals.ela_response.mean(),
        dct_high_frequency_ratio: analysis.signals.dct_coefficients.high_frequency_ratio(),
        content_hash: analysis.image.content_hash.to_hex(),
        payload: record.to_text(),
    }))
}

/// 按交易标识取回存证文本。
pub async fn fetch_provenance(
    State(state): State<Arc<AppState>>,
    Path(tx_id): Path<String>,
) -> Result<Json<RetrievedProvenance>, ApiError> {
    info!(%tx_id, "🔍 provenance lookup");

    let payload = state.ledger.fetch(&tx_id).await.map_err(reject)?;
    // 第三方写入的文本不一定符合布局，原文照样返回
    let record = provenance::parse(&payload).ok();

    Ok(Json(RetrievedProvenance {
        tx_id,
        payload,
        record,
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let chain_id = match state.ledger.rpc().chain_id().await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(%e, "ledger health check failed");
            None
        }
    };
    Json(HealthReport {
        ledger_reachable: chain_id.is_some(),
        chain_id,
        signer: state.ledger.address().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierInput, TamperClassifier};
    use crate::identity::LedgerIdentity;
    use crate::mmr_store::MemoryLedger;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    struct Fixed(f64);

    #[async_trait]
    impl TamperClassifier for Fixed {
        async fn score(&self, _: &ClassifierInput) -> crate::error::Result<f64> {
            Ok(self.0)
        }
    }

    fn state(p: f64) -> Arc<AppState> {
        let identity = Arc::new(LedgerIdentity::from_hex(KEY).unwrap());
        let ledger = LedgerClient::new(Arc::new(MemoryLedger::default()), identity).with_chain_id(Some(1337));
        Arc::new(AppState {
            pipeline: Arc::new(ForensicPipeline::new(Arc::new(Fixed(p)))),
            ledger: Arc::new(ledger),
        })
    }

    #[tokio::test]
    async fn submit_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.png");
        RgbImage::from_pixel(20, 10, Rgb([10, 20, 30])).save(&path).unwrap();

        let st = state(0.1);
        let Json(receipt) = submit_provenance(
            State(st.clone()),
            Json(AnalyzeRequest {
                image_path: path.display().to_string(),
            }),
        )
        .await
        .unwrap();

        // 纯色图噪声为零，取证信号触发
        assert_eq!(receipt.verdict, Verdict::Tampered);
        assert!(receipt.payload.contains("Resolution: 20x10"));

        let Json(found) = fetch_provenance(State(st), Path(receipt.tx_id.clone()))
            .await
            .unwrap();
        assert_eq!(found.payload, receipt.payload);
        let record = found.record.unwrap();
        assert_eq!(record.verdict, Verdict::Tampered);
        assert_eq!(record.image_identifier, path.display().to_string());
    }

    #[tokio::test]
    async fn unreadable_image_is_bad_request() {
        let (status, Json(body)) = submit_provenance(
            State(state(0.1)),
            Json(AnalyzeRequest {
                image_path: "/definitely/not/here.png".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "UNREADABLE_IMAGE");
    }

    #[tokio::test]
    async fn unknown_transaction_is_not_found() {
        let id = format!("0x{}", "ab".repeat(32));
        let (status, Json(body)) = fetch_provenance(State(state(0.1)), Path(id)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "TRANSACTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn health_reports_signer() {
        let Json(report) = health(State(state(0.1))).await;
        assert!(report.ledger_reachable);
        assert_eq!(report.chain_id, Some(1337));
        assert_eq!(report.signer, "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23");
    }
}

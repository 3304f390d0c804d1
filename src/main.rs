use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use yuanjing_provenance::api;
use yuanjing_provenance::classifier::TfServingClassifier;
use yuanjing_provenance::config::{Config, LedgerBackend};
use yuanjing_provenance::fusion::FusionPolicy;
use yuanjing_provenance::identity::LedgerIdentity;
use yuanjing_provenance::ledger::{GasPolicy, LedgerClient};
use yuanjing_provenance::mmr_store::{MemoryLedger, DEFAULT_CHAIN_ID};
use yuanjing_provenance::pipeline::ForensicPipeline;
use yuanjing_provenance::rpc::{HttpLedgerRpc, LedgerRpc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("yuanjing_provenance=info")),
        )
        .init();

    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    info!(?config, "⚙️  配置加载完成");
    info!("🛡️ [原镜 Yuanjing] 图片存证服务启动中...");

    // ----------------------------------------------------------------
    // 1. 身份 & 账本
    // ----------------------------------------------------------------
    let identity = Arc::new(LedgerIdentity::from_hex(&config.private_key)?);
    info!(address = %identity.address(), "🆔 账本身份");

    let rpc: Arc<dyn LedgerRpc> = match &config.ledger {
        LedgerBackend::Http { url } => {
            info!(%url, "📡 使用外部 JSON-RPC 账本");
            Arc::new(HttpLedgerRpc::new(url.clone(), config.receipt_poll))
        }
        LedgerBackend::Memory => {
            let chain_id = config.chain_id.unwrap_or(DEFAULT_CHAIN_ID);
            info!(chain_id, "📚 使用进程内开发账本 (不落盘)");
            Arc::new(MemoryLedger::new(chain_id))
        }
    };

    // 连通性检查只记日志，节点稍后上线也能正常服务
    match rpc.chain_id().await {
        Ok(id) => {
            info!(chain_id = id, "✅ 账本连接成功");
            if let Some(configured) = config.chain_id {
                if configured != id {
                    warn!(configured, reported = id, "CHAIN_ID 与账本报告的不一致");
                }
            }
        }
        Err(e) => warn!(%e, "⚠️  账本暂不可达，提交会失败直到其恢复"),
    }

    let ledger = LedgerClient::new(rpc, identity)
        .with_gas_policy(GasPolicy::from_gwei(config.gas_limit, config.gas_price_gwei))
        .with_chain_id(config.chain_id);

    // ----------------------------------------------------------------
    // 2. 取证流水线
    // ----------------------------------------------------------------
    let classifier = TfServingClassifier::new(config.classifier_url.clone());
    info!(url = classifier.url(), "🧠 分类器端点");
    let pipeline = ForensicPipeline::new(Arc::new(classifier))
        .with_policy(FusionPolicy::new(config.noise_threshold))
        .with_ela_quality(config.ela_quality);

    let state = Arc::new(api::AppState {
        pipeline: Arc::new(pipeline),
        ledger: Arc::new(ledger),
    });

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("🚀 API 服务已运行在: http://{addr}");
    info!("   - POST /provenance          : 分析图片并上链");
    info!("   - GET  /provenance/{{tx_id}} : 按交易标识取回存证");
    info!("   - GET  /health              : 账本连通性");

    axum::serve(listener, app).await?;

    Ok(())
}

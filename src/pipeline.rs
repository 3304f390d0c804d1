use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::classifier::{classify, preprocess, TamperClassifier};
use crate::error::{Error, Result};
use crate::fingerprint::{load_image, ImageRecord};
use crate::decoded::DecodedImage;
use crate::forensics::{
    error_level, frequency_transform, noise_variance, ForensicSignals, ResidueMap, ELA_QUALITY,
};
use crate::fusion::{FusionPolicy, Verdict};
use crate::provenance::ProvenanceRecord;

/// 流水线阶段。只在对应工作真正完成时上报，中间四个阶段之间没有先后保证。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decoded,
    ErrorLevel,
    Noise,
    Frequency,
    Classified,
    Fused,
}

/// 进度接收方。
pub trait ProgressSink: Send + Sync {
    fn stage_completed(&self, stage: Stage);
}

/// 不关心进度。
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn stage_completed(&self, _stage: Stage) {}
}

/// 把阶段完成写进日志。
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn stage_completed(&self, stage: Stage) {
        debug!(?stage, "pipeline stage completed");
    }
}

/// 转发给异步消费方 (例如 UI 进度条)。接收端关闭后静默丢弃。
impl ProgressSink for mpsc::UnboundedSender<Stage> {
    fn stage_completed(&self, stage: Stage) {
        let _ = self.send(stage);
    }
}

/// 一次分析的完整结果。
#[derive(Debug, Clone)]
pub struct Analysis {
    pub image: ImageRecord,
    pub signals: ForensicSignals,
    pub probability: f64,
    pub verdict: Verdict,
}

impl Analysis {
    /// 准备上链的存证记录。
    pub fn provenance(&self) -> ProvenanceRecord {
        ProvenanceRecord::from_image(&self.image, self.verdict)
    }
}

/// 取证流水线 (Forensic Pipeline)
///
/// ```text
/// 图片 ─▶ 指纹+解码 ─┬─▶ ELA ────────┐
///                   ├─▶ 噪声 ───────┤
///                   ├─▶ DCT ────────┼─▶ 融合 ─▶ Verdict
///                   └─▶ 预处理+分类 ┘
/// ```
///
/// 解码后的像素放进 `Arc` 只读共享，四个分支各自在阻塞线程池上运行，汇合后再做融合。
pub struct ForensicPipeline {
    classifier: Arc<dyn TamperClassifier>,
    policy: FusionPolicy,
    ela_quality: u8,
}

impl ForensicPipeline {
    pub fn new(classifier: Arc<dyn TamperClassifier>) -> Self {
        Self {
            classifier,
            policy: FusionPolicy::default(),
            ela_quality: ELA_QUALITY,
        }
    }

    pub fn with_policy(mut self, policy: FusionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ela_quality(mut self, quality: u8) -> Self {
        self.ela_quality = quality;
        self
    }

    pub fn policy(&self) -> &FusionPolicy {
        &self.policy
    }

    pub async fn analyze(&self, path: &Path, progress: &dyn ProgressSink) -> Result<Analysis> {
        let started = Instant::now();

        // 1. 指纹 + 解码 (CPU / IO 密集，放到阻塞线程)
        let owned = path.to_path_buf();
        let loaded = spawn_blocking(move || load_image(&owned)).await??;
        progress.stage_completed(Stage::Decoded);

        let pixels = Arc::new(loaded.pixels);
        let quality = self.ela_quality;

        // 2. 四个分支并发
        let ela = {
            let px = Arc::clone(&pixels);
            let source = loaded.record.source_path.clone();
            async move {
                let map = spawn_blocking(move || residue_of(&*px, quality, &source)).await??;
                progress.stage_completed(Stage::ErrorLevel);
                Ok::<_, Error>(map)
            }
        };
        let noise = {
            let px = Arc::clone(&pixels);
            async move {
                let v = spawn_blocking(move || noise_variance(&*px)).await?;
                progress.stage_completed(Stage::Noise);
                Ok::<_, Error>(v)
            }
        };
        let dct = {
            let px = Arc::clone(&pixels);
            async move {
                let plane = spawn_blocking(move || frequency_transform(&*px)).await?;
                progress.stage_completed(Stage::Frequency);
                Ok::<_, Error>(plane)
            }
        };
        let probability = {
            let px = Arc::clone(&pixels);
            let classifier = Arc::clone(&self.classifier);
            async move {
                let input = spawn_blocking(move || preprocess(&*px)).await?;
                let p = classify(classifier.as_ref(), &input).await?;
                progress.stage_completed(Stage::Classified);
                Ok::<_, Error>(p)
            }
        };

        let (ela_response, noise_variance, dct_coefficients, probability) =
            tokio::try_join!(ela, noise, dct, probability)?;

        // 3. 融合
        let verdict = self.policy.fuse(probability, noise_variance);
        progress.stage_completed(Stage::Fused);

        info!(
            path = %loaded.record.source_path,
            hash = %loaded.record.content_hash,
            probability,
            noise_variance,
            %verdict,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );

        Ok(Analysis {
            image: loaded.record,
            signals: ForensicSignals {
                ela_response,
                noise_variance,
                dct_coefficients,
            },
            probability,
            verdict,
        })
    }
}

// 重编码失败发生在内存缓冲上，报告时换回源文件路径
fn residue_of<I: DecodedImage>(img: &I, quality: u8, source: &str) -> Result<ResidueMap> {
    error_level(img, quality).map_err(|e| e.at_path(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierInput;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;

    struct Fixed(f64);

    #[async_trait]
    impl TamperClassifier for Fixed {
        async fn score(&self, input: &ClassifierInput) -> Result<f64> {
            assert_eq!(input.shape(), [1, 224, 224, 3]);
            Ok(self.0)
        }
    }

    fn noisy(w: u32, h: u32) -> RgbImage {
        let mut state: u32 = 42;
        RgbImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let v = (state >> 16) as u8;
            Rgb([v, v.wrapping_add(30), v.wrapping_sub(30)])
        })
    }

    #[tokio::test]
    async fn noisy_photo_with_low_score_is_authentic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noisy.png");
        noisy(48, 32).save(&path).unwrap();

        let pipeline = ForensicPipeline::new(Arc::new(Fixed(0.1)));
        let analysis = pipeline.analyze(&path, &NoProgress).await.unwrap();
        assert!(analysis.signals.noise_variance > 100.0);
        assert_eq!(analysis.verdict, Verdict::Authentic);
        assert_eq!((analysis.image.width, analysis.image.height), (48, 32));
        assert_eq!(analysis.signals.ela_response.width(), 48);
        assert_eq!(analysis.signals.dct_coefficients.height(), 32);
    }

    #[tokio::test]
    async fn smooth_image_trips_forensic_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.png");
        RgbImage::from_pixel(40, 40, Rgb([90, 90, 90])).save(&path).unwrap();

        let pipeline = ForensicPipeline::new(Arc::new(Fixed(0.2)));
        let analysis = pipeline.analyze(&path, &NoProgress).await.unwrap();
        assert_eq!(analysis.signals.noise_variance, 0.0);
        assert_eq!(analysis.verdict, Verdict::Tampered);
        assert!(analysis.provenance().to_text().ends_with("Tampering Result: Tampered"));
    }

    #[tokio::test]
    async fn every_stage_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        noisy(16, 16).save(&path).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        ForensicPipeline::new(Arc::new(Fixed(0.9)))
            .analyze(&path, &tx)
            .await
            .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(stage) = rx.recv().await {
            seen.push(stage);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.first(), Some(&Stage::Decoded));
        assert_eq!(seen.last(), Some(&Stage::Fused));
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[tokio::test]
    async fn missing_file_is_unreadable() {
        let pipeline = ForensicPipeline::new(Arc::new(Fixed(0.1)));
        let err = pipeline
            .analyze(Path::new("/no/such/image.jpg"), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnreadableImage { .. }));
    }

    /// 能解码，但无法再编码成 JPEG 的缓冲。
    struct Unencodable;

    impl DecodedImage for Unencodable {
        fn width(&self) -> u32 {
            2
        }
        fn height(&self) -> u32 {
            2
        }
        fn rgb(&self, _x: u32, _y: u32) -> [u8; 3] {
            [0, 0, 0]
        }
        fn recompress_jpeg(&self, _quality: u8) -> Result<Self> {
            Err(Error::unreadable("<in-memory>", "jpeg re-encode: dimensions too large"))
        }
    }

    #[test]
    fn recompression_failure_names_the_source_file() {
        let err = residue_of(&Unencodable, ELA_QUALITY, "/photos/panorama.png").unwrap_err();
        assert!(matches!(
            &err,
            Error::UnreadableImage { path, reason }
                if path == "/photos/panorama.png" && reason.contains("re-encode")
        ));
    }

    #[tokio::test]
    async fn classifier_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        noisy(8, 8).save(&path).unwrap();

        let pipeline = ForensicPipeline::new(Arc::new(Fixed(7.0)));
        let err = pipeline.analyze(&path, &NoProgress).await.unwrap_err();
        assert!(matches!(err, Error::Classifier(_)));
    }
}

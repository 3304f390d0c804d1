use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::decoded::DecodedImage;
use crate::error::{Error, Result};

/// 模块：篡改分类器接口 (Tamper Classifier)
///
/// 分类器本身是一个预训练好的黑盒打分函数，这里只规定输入输出契约和喂给它的预处理流程。
/// 预处理必须逐位复现，否则分数之间不可比：
/// 1. 转 RGB
/// 2. 最近邻缩放到 224×224
/// 3. 每个通道除以 255
/// 4. 组成单元素 batch，NHWC 布局 `[1, 224, 224, 3]`

/// 模型输入边长。
pub const INPUT_SIZE: u32 = 224;

/// 预处理后的张量，NHWC，batch = 1。
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierInput {
    data: Vec<f32>,
}

impl ClassifierInput {
    pub fn shape(&self) -> [usize; 4] {
        [1, INPUT_SIZE as usize, INPUT_SIZE as usize, 3]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// (x, y) 处的三通道值。
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let i = (y as usize * INPUT_SIZE as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// 嵌套成 `[H][W][C]`，给 JSON 类接口用。
    fn rows(&self) -> Vec<Vec<[f32; 3]>> {
        (0..INPUT_SIZE)
            .map(|y| (0..INPUT_SIZE).map(|x| self.pixel(x, y)).collect())
            .collect()
    }
}

/// 固定预处理流程。
pub fn preprocess<I: DecodedImage>(img: &I) -> ClassifierInput {
    let (sw, sh) = (img.width().max(1), img.height().max(1));
    let n = INPUT_SIZE as usize;
    let mut data = Vec::with_capacity(n * n * 3);

    for y in 0..INPUT_SIZE {
        let sy = nearest_source(y, sh);
        for x in 0..INPUT_SIZE {
            let sx = nearest_source(x, sw);
            let [r, g, b] = img.rgb(sx, sy);
            data.extend_from_slice(&[r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0]);
        }
    }
    ClassifierInput { data }
}

// 按像素中心取最近的源像素
fn nearest_source(dst: u32, src_len: u32) -> u32 {
    let scale = src_len as f64 / INPUT_SIZE as f64;
    (((dst as f64 + 0.5) * scale) as u32).min(src_len - 1)
}

/// 预训练打分函数的接入点。
#[async_trait]
pub trait TamperClassifier: Send + Sync {
    /// 返回篡改概率，应当落在 [0, 1]。
    async fn score(&self, input: &ClassifierInput) -> Result<f64>;
}

/// 打分并校验概率区间；NaN 或越界一律视为分类器故障。
pub async fn classify(classifier: &dyn TamperClassifier, input: &ClassifierInput) -> Result<f64> {
    let p = classifier.score(input).await?;
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::Classifier(format!("probability {p} outside [0, 1]")));
    }
    Ok(p)
}

// ==========================================
// TensorFlow Serving REST 适配器
// ==========================================

/// 通过 TensorFlow Serving 的 `:predict` REST 接口调用模型。
///
/// 请求：`{"instances": [[[[r,g,b], ...], ...]]}`
/// 响应：`{"predictions": [[p]]}`
pub struct TfServingClassifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct PredictRequest {
    instances: Vec<Vec<Vec<[f32; 3]>>>,
}

impl TfServingClassifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TamperClassifier for TfServingClassifier {
    async fn score(&self, input: &ClassifierInput) -> Result<f64> {
        let body = PredictRequest {
            instances: vec![input.rows()],
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Classifier(format!("request to {} failed: {e}", self.url)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Classifier(format!("model server answered {status}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Classifier(format!("unreadable model response: {e}")))?;
        parse_prediction(&json)
    }
}

/// 取出 batch 中第一条预测的第一个输出。
pub fn parse_prediction(json: &Value) -> Result<f64> {
    let first = json
        .get("predictions")
        .and_then(Value::as_array)
        .and_then(|preds| preds.first())
        .ok_or_else(|| Error::Classifier("response has no predictions".into()))?;

    let value = match first {
        Value::Array(outputs) => outputs.first(),
        other => Some(other),
    };

    value
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Classifier(format!("prediction is not a number: {first}")))
}

use rayon::prelude::*;
use rustdct::{Dct2, DctPlanner, TransformType2And3};

use crate::decoded::{DecodedImage, LumaPlane};
use crate::error::Result;

/// 模块：取证信号提取 (Forensic Signal Extractors)
///
/// 三个互相独立、无状态的分析器，全部只读同一份解码后的像素：
/// - **ELA**: 重压缩残差图，篡改区域的压缩历史与周围不一致，残差会偏高或不均匀。
/// - **噪声**: 灰度图做拉普拉斯算子后的方差。自然照片噪声高，平滑/粘贴/重渲染区域偏低。
/// - **DCT**: 整帧二维余弦变换，拼接痕迹表现为高频系数异常。
///
/// 这里只产出信号，阈值判定在 `fusion` 里。任何分析器都不读写文件。

/// ELA 重编码使用的 JPEG 质量。
pub const ELA_QUALITY: u8 = 90;

/// ELA 残差的对比度放大倍数。
pub const ELA_CONTRAST_FACTOR: f32 = 10.0;

// ==========================================
// 1. 压缩残差 (Error Level Analysis)
// ==========================================

/// 每像素 RGB 残差幅度，行优先、通道交错存储。
#[derive(Debug, Clone, PartialEq)]
pub struct ResidueMap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ResidueMap {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// 所有通道残差的平均值。
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| v as u64).sum::<u64>() as f64 / self.data.len() as f64
    }

    pub fn max(&self) -> u8 {
        self.data.iter().copied().max().unwrap_or(0)
    }
}

/// 重编码 → 逐通道绝对差 → 围绕残差平均亮度做对比度放大。
pub fn error_level<I: DecodedImage>(img: &I, quality: u8) -> Result<ResidueMap> {
    let recompressed = img.recompress_jpeg(quality)?;
    let (w, h) = (img.width(), img.height());

    let mut diff = Vec::with_capacity(w as usize * h as usize * 3);
    for y in 0..h {
        for x in 0..w {
            let a = img.rgb(x, y);
            let b = recompressed.rgb(x, y);
            diff.extend_from_slice(&[a[0].abs_diff(b[0]), a[1].abs_diff(b[1]), a[2].abs_diff(b[2])]);
        }
    }

    let mean = residue_luma_mean(&diff);
    stretch_contrast(&mut diff, mean);

    Ok(ResidueMap {
        width: w,
        height: h,
        data: diff,
    })
}

// 对比度增强取均值时使用 16 位定点的 ITU-R 601 亮度
fn luma_itu601([r, g, b]: [u8; 3]) -> u8 {
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

/// 交错 RGB 残差的平均亮度，四舍五入到整数。
fn residue_luma_mean(diff: &[u8]) -> i32 {
    let pixels = diff.len() / 3;
    if pixels == 0 {
        return 0;
    }
    let sum: u64 = diff
        .chunks_exact(3)
        .map(|p| luma_itu601([p[0], p[1], p[2]]) as u64)
        .sum();
    (sum as f64 / pixels as f64 + 0.5) as i32
}

/// out = mean + k·(v − mean)，截断后夹到 [0, 255]。
fn stretch_contrast(diff: &mut [u8], mean: i32) {
    for v in diff.iter_mut() {
        let t = mean as f32 + ELA_CONTRAST_FACTOR * (*v as i32 - mean) as f32;
        *v = t.clamp(0.0, 255.0) as u8;
    }
}

// ==========================================
// 2. 噪声估计 (Laplacian Variance)
// ==========================================

/// 灰度化后求拉普拉斯响应的方差。
pub fn noise_variance<I: DecodedImage>(img: &I) -> f64 {
    laplacian_variance(&img.to_luma())
}

/// 3×3 拉普拉斯核 `[0 1 0; 1 -4 1; 0 1 0]`，边界按 reflect-101 处理，返回总体方差。
pub fn laplacian_variance(luma: &LumaPlane) -> f64 {
    let (w, h) = (luma.width() as i64, luma.height() as i64);
    if w == 0 || h == 0 {
        return 0.0;
    }

    // 拉普拉斯响应都是整数，逐行精确累加 Σx 与 Σx²
    let (sum, sum_sq) = (0..h)
        .into_par_iter()
        .map(|y| {
            let mut s: i64 = 0;
            let mut sq: i64 = 0;
            for x in 0..w {
                let at = |xx: i64, yy: i64| -> i64 {
                    luma.get(reflect101(xx, w) as u32, reflect101(yy, h) as u32) as i64
                };
                let l = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4 * at(x, y);
                s += l;
                sq += l * l;
            }
            (s, sq)
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    let n = (w * h) as f64;
    let mean = sum as f64 / n;
    (sum_sq as f64 / n - mean * mean).max(0.0)
}

// gfedcb|abcdefgh|gfedcba
fn reflect101(i: i64, n: i64) -> i64 {
    if n == 1 {
        0
    } else if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    }
}

// ==========================================
// 3. 频域变换 (DCT)
// ==========================================

/// 整帧 DCT 系数，`get(u, v)` 中 u 是水平频率，v 是垂直频率。
#[derive(Debug, Clone, PartialEq)]
pub struct DctPlane {
    width: u32,
    height: u32,
    coeffs: Vec<f32>,
}

impl DctPlane {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, u: u32, v: u32) -> f32 {
        self.coeffs[v as usize * self.width as usize + u as usize]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.coeffs
    }

    /// 交流能量中落在高频带 (u/W + v/H > 0.5) 的比例。没有交流能量时为 0。
    pub fn high_frequency_ratio(&self) -> f64 {
        let (w, h) = (self.width as f64, self.height as f64);
        let mut total = 0.0f64;
        let mut high = 0.0f64;
        for v in 0..self.height {
            for u in 0..self.width {
                if u == 0 && v == 0 {
                    continue;
                }
                let c = self.get(u, v) as f64;
                let e = c * c;
                total += e;
                if u as f64 / w + v as f64 / h > 0.5 {
                    high += e;
                }
            }
        }
        if total > 0.0 {
            high / total
        } else {
            0.0
        }
    }
}

/// 灰度化、归一化到 [0,1]，再做二维 DCT。
pub fn frequency_transform<I: DecodedImage>(img: &I) -> DctPlane {
    dct2(&img.to_luma())
}

/// 正交归一化的二维 DCT-II，可分离实现：先行后列，任意尺寸。
/// 每一维都走 O(n log n) 的快速变换，不构造稠密余弦矩阵。
pub fn dct2(luma: &LumaPlane) -> DctPlane {
    let (w, h) = (luma.width() as usize, luma.height() as usize);
    if w == 0 || h == 0 {
        return DctPlane {
            width: luma.width(),
            height: luma.height(),
            coeffs: Vec::new(),
        };
    }

    let mut planner = DctPlanner::new();
    let row_plan = planner.plan_dct2(w);
    let col_plan = planner.plan_dct2(h);

    let mut rows: Vec<f64> = luma.as_slice().iter().map(|&p| p as f64 / 255.0).collect();

    // 行变换
    rows.par_chunks_mut(w).for_each(|row| orthonormal_dct(row, row_plan.as_ref()));

    // 列变换：转置后当作行再做一遍
    let mut cols = transpose(&rows, w, h);
    cols.par_chunks_mut(h).for_each(|col| orthonormal_dct(col, col_plan.as_ref()));

    let out = transpose(&cols, h, w);
    DctPlane {
        width: luma.width(),
        height: luma.height(),
        coeffs: out.into_iter().map(|c| c as f32).collect(),
    }
}

// 快速变换输出未归一化：X[0]·√(1/n)，其余 X[k]·√(2/n)
fn orthonormal_dct(line: &mut [f64], plan: &dyn TransformType2And3<f64>) {
    plan.process_dct2(line);
    let n = line.len() as f64;
    let (c0, ck) = ((1.0 / n).sqrt(), (2.0 / n).sqrt());
    for (k, v) in line.iter_mut().enumerate() {
        *v *= if k == 0 { c0 } else { ck };
    }
}

// (rows × cols) → (cols × rows)
fn transpose(src: &[f64], cols: usize, rows: usize) -> Vec<f64> {
    let mut dst = vec![0.0; src.len()];
    for r in 0..rows {
        for c in 0..cols {
            dst[c * rows + r] = src[r * cols + c];
        }
    }
    dst
}

// ==========================================
// 4. 信号集合
// ==========================================

/// 一次分析的全部取证信号，三者来自同一份像素。由流水线并发产出后汇合。
#[derive(Debug, Clone)]
pub struct ForensicSignals {
    pub ela_response: ResidueMap,
    pub noise_variance: f64,
    pub dct_coefficients: DctPlane,
}

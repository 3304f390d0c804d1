use image::{ColorType, DynamicImage, ImageFormat, RgbImage};
use std::path::Path;

use crate::error::{Error, Result};

/// 模块：解码后的像素缓冲 (Decoded Image)
///
/// 所有取证分析器和分类器只认这一个能力接口：宽、高、像素访问、单通道转换、有损重编码。
/// 编解码相关的细节全部关在这个文件里，取证算法不直接碰 `image` crate。
pub trait DecodedImage: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// (x, y) 处的 RGB 三元组。
    fn rgb(&self, x: u32, y: u32) -> [u8; 3];

    /// 转成单通道灰度 (BT.601 定点，与常见 CV 库的 RGB→GRAY 一致)。
    fn to_luma(&self) -> LumaPlane {
        let (w, h) = (self.width(), self.height());
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(luma_bt601(self.rgb(x, y)));
            }
        }
        LumaPlane::new(w, h, data)
    }

    /// 以给定质量做一次 JPEG 编码再解码，返回同尺寸的新缓冲。
    fn recompress_jpeg(&self, quality: u8) -> Result<Self>
    where
        Self: Sized;
}

/// Y = 0.299 R + 0.587 G + 0.114 B，14 位定点并四舍五入。
pub fn luma_bt601([r, g, b]: [u8; 3]) -> u8 {
    ((r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14) as u8
}

/// 单通道 8 位平面，行优先存储。
#[derive(Debug, Clone, PartialEq)]
pub struct LumaPlane {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl LumaPlane {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize);
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl DecodedImage for RgbImage {
    fn width(&self) -> u32 {
        self.dimensions().0
    }

    fn height(&self) -> u32 {
        self.dimensions().1
    }

    fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        self.get_pixel(x, y).0
    }

    fn recompress_jpeg(&self, quality: u8) -> Result<Self> {
        let mut buf = Vec::new();
        {
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
            encoder
                .encode(self.as_raw(), self.width(), self.height(), ColorType::Rgb8)
                .map_err(|e| Error::unreadable("<in-memory>", format!("jpeg re-encode: {e}")))?;
        }

        let decoded = image::load_from_memory_with_format(&buf, ImageFormat::Jpeg)
            .map_err(|e| Error::unreadable("<in-memory>", format!("jpeg re-decode: {e}")))?;
        Ok(decoded.to_rgb8())
    }
}

/// 容器解码结果：RGB 像素 + 容器声明的格式与色彩模式。
pub struct DecodedFile {
    pub pixels: RgbImage,
    pub format: String,
    pub color_mode: String,
}

/// 打开并解码图片容器。格式靠内容嗅探，不看扩展名。
pub fn decode_file(path: &Path) -> Result<DecodedFile> {
    let shown = path.display().to_string();

    let reader = image::io::Reader::open(path)
        .map_err(|e| Error::unreadable(&shown, e))?
        .with_guessed_format()
        .map_err(|e| Error::unreadable(&shown, e))?;

    let format = reader
        .format()
        .ok_or_else(|| Error::unreadable(&shown, "unrecognised image container"))?;

    let img: DynamicImage = reader.decode().map_err(|e| Error::unreadable(&shown, e))?;

    Ok(DecodedFile {
        color_mode: color_mode_name(img.color()).to_string(),
        format: format_name(format),
        pixels: img.to_rgb8(),
    })
}

/// 容器格式的大写短名 (JPEG / PNG / GIF / BMP ...)。
pub fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        ImageFormat::Gif => "GIF".to_string(),
        ImageFormat::Bmp => "BMP".to_string(),
        other => format!("{other:?}").to_uppercase(),
    }
}

/// 色彩模式短名，沿用常见的 L / LA / RGB / RGBA 命名。
/// 注意：GIF 调色板图在解码后已经展开为 RGBA。
pub fn color_mode_name(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 => "L",
        ColorType::La8 => "LA",
        ColorType::Rgb8 => "RGB",
        ColorType::Rgba8 => "RGBA",
        ColorType::L16 => "I;16",
        ColorType::La16 => "LA;16",
        ColorType::Rgb16 => "RGB;16",
        ColorType::Rgba16 => "RGBA;16",
        ColorType::Rgb32F => "RGB;F",
        ColorType::Rgba32F => "RGBA;F",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn luma_of_primaries() {
        assert_eq!(luma_bt601([255, 255, 255]), 255);
        assert_eq!(luma_bt601([0, 0, 0]), 0);
        assert_eq!(luma_bt601([255, 0, 0]), 76);
        assert_eq!(luma_bt601([0, 255, 0]), 150);
        assert_eq!(luma_bt601([0, 0, 255]), 29);
    }

    #[test]
    fn to_luma_keeps_geometry() {
        let img = RgbImage::from_fn(5, 3, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 7]));
        let luma = img.to_luma();
        assert_eq!((luma.width(), luma.height()), (5, 3));
        assert_eq!(luma.as_slice().len(), 15);
        assert_eq!(luma.get(4, 2), luma_bt601([160, 120, 7]));
    }

    #[test]
    fn jpeg_recompress_preserves_dimensions() {
        let img = RgbImage::from_pixel(17, 9, Rgb([120, 80, 200]));
        let again = img.recompress_jpeg(90).unwrap();
        assert_eq!(again.dimensions(), (17, 9));
    }

    #[test]
    fn decode_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_image.png");
        std::fs::write(&path, b"definitely not pixels").unwrap();
        let err = decode_file(&path).err().unwrap();
        assert!(matches!(err, Error::UnreadableImage { .. }));
    }

    #[test]
    fn decode_reports_container_facts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        image::GrayImage::from_pixel(4, 4, image::Luma([9])).save(&path).unwrap();
        let decoded = decode_file(&path).unwrap();
        assert_eq!(decoded.format, "PNG");
        assert_eq!(decoded.color_mode, "L");
        assert_eq!(decoded.pixels.dimensions(), (4, 4));
    }
}

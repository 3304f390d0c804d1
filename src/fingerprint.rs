use chrono::{DateTime, Utc};
use image::RgbImage;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::decoded::decode_file;
use crate::error::{Error, Result};

/// 流式读取的块大小。任意大的文件都只占用固定内存。
pub const CHUNK_SIZE: usize = 8192;

/// 元数据摘要里时间戳的固定格式 (UTC)。
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 256 位内容指纹 (SHA-256)。
///
/// 只由图片字节决定：同样的字节无论文件名、路径、计算时间如何，结果都相同。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64 字符小写十六进制。
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// 把任意 Reader 按块喂给 SHA-256。
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&chunk[..n]);
    }
    Ok(ContentHash(hasher.finalize().into()))
}

/// 内存中的字节直接算指纹。
pub fn fingerprint(image_bytes: &[u8]) -> ContentHash {
    ContentHash(Sha256::digest(image_bytes).into())
}

/// 从磁盘流式计算指纹。
pub fn fingerprint_file(path: &Path) -> Result<ContentHash> {
    let file = File::open(path).map_err(|e| Error::unreadable(path.display().to_string(), e))?;
    fingerprint_reader(file).map_err(|e| Error::unreadable(path.display().to_string(), e))
}

/// 一次分析所对应的图片记录 (瞬态，不落盘)。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub source_path: String,
    pub content_hash: ContentHash,
    pub width: u32,
    pub height: u32,
    pub color_mode: String,
    pub encoding_format: String,
    pub byte_size: u64,
    /// 分析发生的时间，不是图片拍摄时间。
    pub captured_at_utc: DateTime<Utc>,
}

impl ImageRecord {
    /// 人类可读的元数据摘要，字段顺序固定。
    pub fn metadata_summary(&self) -> String {
        format!(
            "Timestamp: {}\nResolution: {}x{}\nFormat: {}\nMode: {}\nSize: {} bytes\nHash: {}",
            self.captured_at_utc.format(TIMESTAMP_FORMAT),
            self.width,
            self.height,
            self.encoding_format,
            self.color_mode,
            self.byte_size,
            self.content_hash,
        )
    }
}

/// 解码结果 + 记录。像素只解码一次，之后所有分析器共享它。
pub struct LoadedImage {
    pub record: ImageRecord,
    pub pixels: RgbImage,
}

/// 读取图片：流式指纹 + 容器解码 + 文件系统字节数。
pub fn load_image(path: &Path) -> Result<LoadedImage> {
    let shown = path.display().to_string();

    let content_hash = fingerprint_file(path)?;
    let byte_size = std::fs::metadata(path)
        .map_err(|e| Error::unreadable(&shown, e))?
        .len();
    let decoded = decode_file(path)?;

    let record = ImageRecord {
        source_path: shown,
        content_hash,
        width: decoded.pixels.width(),
        height: decoded.pixels.height(),
        color_mode: decoded.color_mode,
        encoding_format: decoded.format,
        byte_size,
        captured_at_utc: Utc::now(),
    };

    Ok(LoadedImage {
        record,
        pixels: decoded.pixels,
    })
}

/// 只要元数据，不保留像素。
pub fn extract_metadata(path: &Path) -> Result<ImageRecord> {
    load_image(path).map(|loaded| loaded.record)
}

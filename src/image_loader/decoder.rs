//! # 解码模块
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → BGRA8 预乘像素”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 猜测格式并读取 header 尺寸
//! 2. 按像素 / 内存上限快速拒绝
//! 3. 完整解码为 RGBA8
//! 4. 转换为 BGRA8 预乘 alpha，并校验字节长度一致性

use std::io::Cursor;

use image::GenericImageView;

use super::source::PixelBuffer;
use super::{ImageError, ImageLoaderConfig};

/// 字节 → 像素缓冲的解码接口，可由宿主替换为平台解码器。
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer, ImageError>;
}

/// 基于 `image` crate 的默认解码器。
#[derive(Debug, Clone)]
pub struct ImageCrateDecoder {
    max_decoded_pixels: u64,
    max_decoded_bytes: u64,
}

impl ImageCrateDecoder {
    pub fn new(config: &ImageLoaderConfig) -> Self {
        Self {
            max_decoded_pixels: config.max_decoded_pixels,
            max_decoded_bytes: config.max_decoded_bytes,
        }
    }

    /// 仅通过内存中的图片头信息读取宽高。
    fn inspect_dimensions(bytes: &[u8]) -> Result<(u32, u32), ImageError> {
        image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ImageError::DecodeFailed(format!("无法识别图片格式：{}", e)))?
            .into_dimensions()
            .map_err(|e| ImageError::DecodeFailed(format!("无法读取图片尺寸：{}", e)))
    }

    fn validate_limits(&self, width: u32, height: u32) -> Result<(), ImageError> {
        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| ImageError::ResourceLimit("图片像素数溢出".to_string()))?;

        if pixels > self.max_decoded_pixels {
            return Err(ImageError::ResourceLimit(format!(
                "图片像素过大：{} 像素（限制：{} 像素）",
                pixels, self.max_decoded_pixels
            )));
        }

        let estimated = pixels
            .checked_mul(4)
            .ok_or_else(|| ImageError::ResourceLimit("图片解码内存估算溢出".to_string()))?;
        if estimated > self.max_decoded_bytes {
            return Err(ImageError::ResourceLimit(format!(
                "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
                estimated as f64 / 1024.0 / 1024.0,
                self.max_decoded_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        Ok(())
    }
}

impl Default for ImageCrateDecoder {
    fn default() -> Self {
        Self::new(&ImageLoaderConfig::default())
    }
}

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer, ImageError> {
        image::guess_format(bytes)
            .map_err(|e| ImageError::DecodeFailed(format!("不支持的图片格式：{}", e)))?;

        let (header_width, header_height) = Self::inspect_dimensions(bytes)?;
        self.validate_limits(header_width, header_height)?;

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ImageError::DecodeFailed(format!("图片解码失败：{}", e)))?;
        let (width, height) = decoded.dimensions();
        self.validate_limits(width, height)?;

        let mut pixels = decoded.to_rgba8().into_raw();
        rgba_to_premultiplied_bgra(&mut pixels);

        let buffer = PixelBuffer::from_raw(width, height, pixels)
            .map_err(|_| ImageError::DecodeFailed("解码后像素数据长度异常".to_string()))?;

        log::debug!("✅ 图片解码成功 - 尺寸: {}x{}", width, height);
        Ok(buffer)
    }
}

/// 原地把 RGBA8 直通 alpha 转为 BGRA8 预乘 alpha。
fn rgba_to_premultiplied_bgra(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let alpha = px[3] as u16;
        let premultiply = |c: u8| ((c as u16 * alpha + 127) / 255) as u8;
        let (r, g, b) = (px[0], px[1], px[2]);
        px[0] = premultiply(b);
        px[1] = premultiply(g);
        px[2] = premultiply(r);
    }
}

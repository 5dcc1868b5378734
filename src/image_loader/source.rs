//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入类型”和“流水线中间结果”解耦：
//! - `ImageSource` / `ImageSourceSet` 表示宿主声明的候选来源
//! - `TargetSize` / `ColorSpec` 表示布局与着色输入
//! - `RawImageData` 表示已获取但未解码的字节
//! - `PixelBuffer` 表示解码后的 BGRA8（预乘 alpha）像素

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use super::ImageError;

/// 宿主侧视图的不透明标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// 单个候选来源：URI + 声明面积（宽 × 高，可缺省）。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    pub uri: String,
    pub declared_area: Option<f64>,
}

impl ImageSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            declared_area: None,
        }
    }

    /// 以声明尺寸构造来源，面积取 `width * height`。
    pub fn with_size(uri: impl Into<String>, width: f64, height: f64) -> Self {
        Self {
            uri: uri.into(),
            declared_area: Some(width * height),
        }
    }
}

/// 同一逻辑图片的有序候选集合，保证非空。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSourceSet {
    sources: Vec<ImageSource>,
}

impl ImageSourceSet {
    /// 空集合在边界处直接拒绝。
    pub fn new(sources: Vec<ImageSource>) -> Result<Self, ImageError> {
        if sources.is_empty() {
            return Err(ImageError::InvalidArgument("来源列表不能为空".to_string()));
        }
        if let Some(blank) = sources.iter().position(|s| s.uri.trim().is_empty()) {
            return Err(ImageError::InvalidArgument(format!("第 {} 个来源的 URI 为空", blank)));
        }

        Ok(Self { sources })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn as_slice(&self) -> &[ImageSource] {
        &self.sources
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ImageSource> {
        self.sources.iter()
    }
}

/// 渲染目标尺寸；布局完成前任一维度可能是 NaN。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSize {
    pub width: f64,
    pub height: f64,
}

impl TargetSize {
    pub const UNRESOLVED: Self = Self {
        width: f64::NAN,
        height: f64::NAN,
    };

    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_resolved(&self) -> bool {
        !self.width.is_nan() && !self.height.is_nan()
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

impl Default for TargetSize {
    fn default() -> Self {
        Self::UNRESOLVED
    }
}

/// 8 位 RGBA 颜色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// 从 `0xAARRGGBB` 解析。
    pub const fn from_argb(argb: u32) -> Self {
        Self {
            a: (argb >> 24) as u8,
            r: (argb >> 16) as u8,
            g: (argb >> 8) as u8,
            b: argb as u8,
        }
    }

    /// 解析 `#RRGGBB` / `#RRGGBBAA`（`#` 可省略）。
    pub fn parse_hex(text: &str) -> Result<Self, ImageError> {
        let hex = text.trim().trim_start_matches('#');
        let invalid = || ImageError::InvalidArgument(format!("颜色格式错误：{}", text));

        if !matches!(hex.len(), 6 | 8) || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let channel = |idx: usize| u8::from_str_radix(&hex[idx..idx + 2], 16).map_err(|_| invalid());
        let a = if hex.len() == 8 { channel(6)? } else { 0xFF };

        Ok(Self::rgba(channel(0)?, channel(2)?, channel(4)?, a))
    }
}

/// 着色输入：两者都缺省时表示“不合成”。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorSpec {
    pub tint: Option<Color>,
    pub background: Option<Color>,
}

impl ColorSpec {
    pub fn new(tint: Option<Color>, background: Option<Color>) -> Self {
        Self { tint, background }
    }

    pub fn is_empty(&self) -> bool {
        self.tint.is_none() && self.background.is_none()
    }
}

/// 解码输出：BGRA8、预乘 alpha，`bytes.len() == width * height * 4`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl PixelBuffer {
    /// 带长度校验的构造。
    pub fn from_raw(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self, ImageError> {
        let buffer = Self { width, height, bytes };
        buffer.validate()?;
        Ok(buffer)
    }

    pub fn expected_len(width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
    }

    /// 空缓冲或长度与尺寸不符均视为非法参数。
    pub fn validate(&self) -> Result<(), ImageError> {
        let expected = Self::expected_len(self.width, self.height)
            .ok_or_else(|| ImageError::InvalidArgument("像素缓冲尺寸溢出".to_string()))?;

        if expected == 0 || self.bytes.is_empty() {
            return Err(ImageError::InvalidArgument("像素缓冲为空".to_string()));
        }
        if self.bytes.len() != expected {
            return Err(ImageError::InvalidArgument(format!(
                "像素缓冲长度异常：{} 字节（期望 {}x{}x4 = {}）",
                self.bytes.len(),
                self.width,
                self.height,
                expected
            )));
        }

        Ok(())
    }
}

/// 成功事件附带的图片元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub uri: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// 获取阶段输出：原始字节与来源标识。
#[derive(Debug, Clone)]
pub struct RawImageData {
    /// 原始图片字节。
    pub bytes: Bytes,
    /// 来源提示（用于日志与诊断）。
    pub source_hint: &'static str,
}

/// 按 URI scheme 划分的来源类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `data:` 内联编码
    Inline,
    /// `http:` / `https:`
    Remote,
    /// 其他一律按本地 / 应用相对路径处理
    Local,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        let uri = uri.trim_start();
        let has_prefix = |prefix: &str| {
            uri.get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        };

        if has_prefix("data:") {
            Self::Inline
        } else if has_prefix("http://") || has_prefix("https://") {
            Self::Remote
        } else {
            Self::Local
        }
    }
}

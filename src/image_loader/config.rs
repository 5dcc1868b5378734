//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `ImageLoaderConfig`，保证运行时行为可观测、可调整、可测试。
//! 获取策略（auto / reference / manual）作为高层语义，决定远程图片走哪条下载路径。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的配置。
//! - 通过 serde 支持从 JSON 加载，缺省字段回落到默认值。
//! - `validate` 集中做取值范围校验，加载配置与宿主修改配置共用同一套规则。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ImageError;

/// 远程图片获取策略。
///
/// - `Auto`：先走一次性“参考”请求，失败后回退到手动分块拷贝
/// - `Reference`：只走参考请求
/// - `Manual`：只走手动分块拷贝（带重试、超时、进度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    Auto,
    Reference,
    Manual,
}

impl FetchStrategy {
    /// 从外部字符串解析策略。
    ///
    /// # 示例
    /// ```rust
    /// use adaptive_image_loader::image_loader::FetchStrategy;
    ///
    /// let strategy = FetchStrategy::from_str("manual")?;
    /// assert_eq!(strategy.as_str(), "manual");
    /// # Ok::<(), adaptive_image_loader::image_loader::ImageError>(())
    /// ```
    pub fn from_str(strategy: &str) -> Result<Self, ImageError> {
        match strategy.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "reference" => Ok(Self::Reference),
            "manual" => Ok(Self::Manual),
            other => Err(ImageError::InvalidArgument(format!(
                "未知获取策略：{}（可选：auto / reference / manual）",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Reference => "reference",
            Self::Manual => "manual",
        }
    }
}

/// 图片加载配置。
///
/// 字段覆盖了获取与解码两个阶段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLoaderConfig {
    /// 获取原始字节时允许的最大体积（字节），对所有来源生效。
    pub max_file_size: u64,
    /// 单次网络请求总超时（秒）。
    pub download_timeout_secs: u64,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout_secs: u64,
    /// 手动拷贝路径：首包超时（毫秒）。
    pub stream_first_byte_timeout_ms: u64,
    /// 手动拷贝路径：分块读取超时（毫秒）。
    pub stream_chunk_timeout_ms: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 手动拷贝路径对可重试错误的最大尝试次数。
    pub network_retries: u8,
    /// 远程获取策略。
    pub fetch_strategy: FetchStrategy,
    /// 已知与参考请求不兼容的主机，直接走手动拷贝路径。
    pub manual_fetch_hosts: Vec<String>,
    /// 应用相对路径（`ms-appx:///`、`asset:///`、相对路径）的根目录。
    pub asset_root: Option<PathBuf>,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 BGRA 估算，字节）。
    pub max_decoded_bytes: u64,
    /// HTTP User-Agent。
    pub user_agent: String,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            download_timeout_secs: 30,
            connect_timeout_secs: 8,
            stream_first_byte_timeout_ms: 10_000,
            stream_chunk_timeout_ms: 15_000,
            max_redirects: 5,
            network_retries: 3,
            fetch_strategy: FetchStrategy::Auto,
            manual_fetch_hosts: Vec::new(),
            asset_root: None,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ImageLoaderConfig {
    /// 从 JSON 文本加载配置并校验。
    pub fn from_json_str(json: &str) -> Result<Self, ImageError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ImageError::InvalidArgument(format!("配置解析失败：{}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验各字段取值范围。
    pub fn validate(&self) -> Result<(), ImageError> {
        if self.max_file_size == 0 {
            return Err(ImageError::InvalidArgument("max_file_size 不能为 0".to_string()));
        }
        if !(1..=300).contains(&self.download_timeout_secs) {
            return Err(ImageError::InvalidArgument(
                "download_timeout_secs 必须在 1~300 秒之间".to_string(),
            ));
        }
        if !(1..=120).contains(&self.connect_timeout_secs) {
            return Err(ImageError::InvalidArgument(
                "connect_timeout_secs 必须在 1~120 秒之间".to_string(),
            ));
        }
        if !(500..=120_000).contains(&self.stream_first_byte_timeout_ms) {
            return Err(ImageError::InvalidArgument(
                "stream_first_byte_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if !(500..=120_000).contains(&self.stream_chunk_timeout_ms) {
            return Err(ImageError::InvalidArgument(
                "stream_chunk_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if self.max_redirects > 20 {
            return Err(ImageError::InvalidArgument("max_redirects 不能大于 20".to_string()));
        }
        if !(1..=10).contains(&self.network_retries) {
            return Err(ImageError::InvalidArgument("network_retries 必须在 1~10 之间".to_string()));
        }
        if self.max_decoded_pixels == 0 {
            return Err(ImageError::InvalidArgument("max_decoded_pixels 不能为 0".to_string()));
        }
        if self.max_decoded_bytes < 1024 * 1024 {
            return Err(ImageError::InvalidArgument("max_decoded_bytes 不能小于 1MB".to_string()));
        }

        Ok(())
    }

    /// 判断主机是否在“只走手动拷贝”名单中（忽略大小写，支持子域名）。
    pub(crate) fn prefers_manual_fetch(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.manual_fetch_hosts.iter().any(|entry| {
            let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
            !entry.is_empty() && (host == entry || host.ends_with(&format!(".{}", entry)))
        })
    }
}

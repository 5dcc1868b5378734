//! # 获取适配模块
//!
//! ## 设计思路
//!
//! 统一处理不同来源（内联 data URI / 远程 URL / 本地与应用相对路径）的原始字节获取，
//! 并在“尽可能早”的阶段执行体积与签名校验，尽快失败。
//!
//! ## 实现思路
//!
//! - 内联：取第一个逗号之后的负载，`;base64` 头走 base64 解码，不发任何网络请求。
//! - 本地：`file://`、`ms-appx:///`、`asset:///` 与相对路径解析后直接读取。
//! - 远程：两条路径。
//!   - 参考请求：一次性 GET，交给 reqwest 处理重定向并整体读取响应体。
//!   - 手动拷贝：手动跟随重定向、可重试错误指数退避、分块读取（首包/分块超时）、进度回调、协作式取消。
//!   `auto` 策略下先走参考请求，失败后回退到手动拷贝；名单中的主机直接走手动拷贝。
//! - 错误统一映射到 `ImageError`，便于上层转换为生命周期事件。

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;

use super::config::FetchStrategy;
use super::source::{RawImageData, SourceKind};
use super::{ImageError, ImageLoaderConfig};

const STREAM_SIGNATURE_PROBE_BYTES: usize = 4096;
const NETWORK_RETRY_BASE_DELAY_MS: u64 = 180;
const NETWORK_RETRY_MAX_DELAY_MS: u64 = 5_000;
const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;
const APP_RELATIVE_SCHEMES: [&str; 3] = ["ms-appx:///", "ms-appx-web:///", "asset:///"];
const ACCEPT_IMAGE: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<RawImageData, ImageError>> + Send + 'a>>;

type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;
type CancelFn = dyn Fn() -> bool + Send + Sync;

/// 获取过程中的回调：进度（已下载字节, 总字节）与取消探测。
#[derive(Clone)]
pub struct FetchHooks {
    on_progress: Arc<ProgressFn>,
    is_cancelled: Arc<CancelFn>,
}

impl FetchHooks {
    pub fn new<P, C>(on_progress: P, is_cancelled: C) -> Self
    where
        P: Fn(u64, Option<u64>) + Send + Sync + 'static,
        C: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            on_progress: Arc::new(on_progress),
            is_cancelled: Arc::new(is_cancelled),
        }
    }

    pub fn progress(&self, downloaded: u64, total: Option<u64>) {
        (self.on_progress)(downloaded, total)
    }

    pub fn is_cancelled(&self) -> bool {
        (self.is_cancelled)()
    }
}

impl Default for FetchHooks {
    fn default() -> Self {
        Self::new(|_, _| {}, || false)
    }
}

/// URI → 字节的获取接口，可由宿主替换为平台实现。
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, uri: &'a str, hooks: FetchHooks) -> FetchFuture<'a>;
}

/// 默认获取实现：按 scheme 分派到内联 / 远程 / 本地。
pub struct UriFetcher {
    config: ImageLoaderConfig,
    reference_client: reqwest::Client,
    manual_client: reqwest::Client,
}

impl UriFetcher {
    /// 根据配置创建获取器。
    ///
    /// 两个 HTTP 客户端在这里一次性构建并复用：参考请求使用 reqwest 的重定向策略，
    /// 手动拷贝路径关闭自动重定向，由自身逐跳校验。
    pub fn new(config: ImageLoaderConfig) -> Result<Self, ImageError> {
        config.validate()?;

        let reference_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ImageError::InvalidArgument(format!("无法创建 HTTP 客户端：{}", e)))?;

        let manual_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ImageError::InvalidArgument(format!("无法创建 HTTP 客户端：{}", e)))?;

        Ok(Self {
            config,
            reference_client,
            manual_client,
        })
    }

    pub fn config(&self) -> &ImageLoaderConfig {
        &self.config
    }

    async fn fetch_uri(&self, uri: &str, hooks: FetchHooks) -> Result<RawImageData, ImageError> {
        let raw = match SourceKind::from_uri(uri) {
            SourceKind::Inline => self.load_inline(uri)?,
            SourceKind::Remote => self.load_remote(uri, &hooks).await?,
            SourceKind::Local => self.load_local(uri).await?,
        };

        Self::validate_image_signature(&raw.bytes)?;
        Ok(raw)
    }

    /// 解析 data URI，不发起任何 I/O。
    fn load_inline(&self, uri: &str) -> Result<RawImageData, ImageError> {
        log::debug!("📝 解析内联图片数据（{} 字符）", uri.len());

        let bytes = Self::parse_data_uri(uri, self.config.max_file_size)?;
        Ok(RawImageData {
            bytes: Bytes::from(bytes),
            source_hint: "inline",
        })
    }

    async fn load_local(&self, uri: &str) -> Result<RawImageData, ImageError> {
        let path = self.resolve_local_path(uri);
        log::debug!("📁 读取本地图片 - 路径: {}", path.display());

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImageError::fetch(uri, format!("文件不存在：{}", path.display()))
            } else {
                ImageError::fetch(uri, format!("无法读取文件信息：{}", e))
            }
        })?;

        if !metadata.is_file() {
            return Err(ImageError::fetch(uri, format!("不是文件：{}", path.display())));
        }
        if metadata.len() > self.config.max_file_size {
            return Err(ImageError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                metadata.len() as f64 / 1024.0 / 1024.0,
                self.config.max_file_size as f64 / 1024.0 / 1024.0
            )));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ImageError::fetch(uri, format!("无法读取图片文件：{}", e)))?;

        Ok(RawImageData {
            bytes: Bytes::from(bytes),
            source_hint: "local",
        })
    }

    async fn load_remote(&self, uri: &str, hooks: &FetchHooks) -> Result<RawImageData, ImageError> {
        let url = reqwest::Url::parse(uri.trim())
            .map_err(|e| ImageError::fetch(uri, format!("URL 格式错误：{}", e)))?;
        let redacted = Self::redact_url_for_log(url.as_str());

        let manual_first = match self.config.fetch_strategy {
            FetchStrategy::Manual => true,
            FetchStrategy::Reference => false,
            FetchStrategy::Auto => url
                .host_str()
                .is_some_and(|host| self.config.prefers_manual_fetch(host)),
        };

        log::info!(
            "🌐 开始下载图片 - URL: {} 路径: {}",
            redacted,
            if manual_first { "manual" } else { "reference" }
        );

        let bytes = if manual_first {
            self.fetch_manual(uri, url, hooks).await?
        } else {
            match self.fetch_reference(uri, url.clone(), hooks).await {
                Ok(bytes) => bytes,
                Err(err @ ImageError::FetchFailed { .. })
                    if self.config.fetch_strategy == FetchStrategy::Auto && !hooks.is_cancelled() =>
                {
                    log::warn!("⚠️ 参考请求失败，回退手动拷贝 - URL: {} 原因: {}", redacted, err);
                    self.fetch_manual(uri, url, hooks).await?
                }
                Err(err) => return Err(err),
            }
        };

        log::debug!("✅ 下载完成 - {} bytes", bytes.len());
        Ok(RawImageData {
            bytes,
            source_hint: "remote",
        })
    }

    /// 参考请求：一次性读取完整响应体。
    async fn fetch_reference(
        &self,
        uri: &str,
        url: reqwest::Url,
        hooks: &FetchHooks,
    ) -> Result<Bytes, ImageError> {
        let response = self
            .reference_client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT_IMAGE)
            .send()
            .await
            .map_err(|e| Self::map_reqwest_error(uri, e))?;

        if !response.status().is_success() {
            return Err(ImageError::fetch(
                uri,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }
        Self::check_content_type(uri, response.headers())?;

        let total_len = response.content_length();
        self.check_declared_length(total_len)?;
        hooks.progress(0, total_len);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::map_reqwest_error(uri, e))?;

        if bytes.len() as u64 > self.config.max_file_size {
            return Err(ImageError::ResourceLimit("下载后文件超过大小限制".to_string()));
        }

        let downloaded = bytes.len() as u64;
        hooks.progress(downloaded, total_len.or(Some(downloaded)));
        Ok(bytes)
    }

    /// 手动拷贝：逐跳跟随重定向，分块读取响应体。
    async fn fetch_manual(
        &self,
        uri: &str,
        url: reqwest::Url,
        hooks: &FetchHooks,
    ) -> Result<Bytes, ImageError> {
        let mut current_url = url;

        for redirect_count in 0..=self.config.max_redirects {
            let response = self.send_with_retry(uri, &current_url, hooks).await?;

            if response.status().is_redirection() {
                if redirect_count >= self.config.max_redirects {
                    return Err(ImageError::fetch(
                        uri,
                        format!("重定向次数超过限制（{}）", self.config.max_redirects),
                    ));
                }

                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| ImageError::fetch(uri, "重定向响应缺少 Location 头"))?;

                let next_url = current_url
                    .join(location)
                    .map_err(|e| ImageError::fetch(uri, format!("重定向 URL 解析失败：{}", e)))?;

                if next_url.scheme() != "http" && next_url.scheme() != "https" {
                    return Err(ImageError::fetch(uri, "重定向目标仅支持 HTTP/HTTPS"));
                }

                log::debug!("↪️ 跳转到: {}", Self::redact_url_for_log(next_url.as_str()));
                current_url = next_url;
                continue;
            }

            if !response.status().is_success() {
                return Err(ImageError::fetch(
                    uri,
                    format!("HTTP {}", response.status().as_u16()),
                ));
            }
            Self::check_content_type(uri, response.headers())?;

            return self.copy_body(uri, response, hooks).await;
        }

        Err(ImageError::fetch(uri, "下载流程异常结束"))
    }

    async fn send_with_retry(
        &self,
        uri: &str,
        url: &reqwest::Url,
        hooks: &FetchHooks,
    ) -> Result<reqwest::Response, ImageError> {
        let max_attempts = self.config.network_retries.max(1);
        let mut attempt: u8 = 1;

        loop {
            if hooks.is_cancelled() {
                return Err(ImageError::Cancelled("图片下载已取消".to_string()));
            }

            let result = self
                .manual_client
                .get(url.clone())
                .header(reqwest::header::ACCEPT, ACCEPT_IMAGE)
                .send()
                .await;

            let delay_ms = match result {
                Ok(response) => {
                    if attempt >= max_attempts || !Self::is_retryable_http_status(response.status()) {
                        return Ok(response);
                    }

                    let delay_ms = Self::compute_retry_delay_with_jitter(
                        attempt,
                        Self::retry_after_hint_ms(response.headers()),
                    );
                    log::warn!(
                        "⚠️ HTTP {}（第 {}/{} 次，可重试）；{}ms 后重试",
                        response.status().as_u16(),
                        attempt,
                        max_attempts,
                        delay_ms
                    );
                    delay_ms
                }
                Err(err) => {
                    if attempt >= max_attempts || !Self::is_retryable_network_error(&err) {
                        return Err(Self::map_reqwest_error(uri, err));
                    }

                    let delay_ms = Self::compute_retry_delay_with_jitter(attempt, None);
                    log::warn!(
                        "⚠️ 网络请求失败（第 {}/{} 次，可重试）：{}；{}ms 后重试",
                        attempt,
                        max_attempts,
                        err.without_url(),
                        delay_ms
                    );
                    delay_ms
                }
            };

            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn copy_body(
        &self,
        uri: &str,
        mut response: reqwest::Response,
        hooks: &FetchHooks,
    ) -> Result<Bytes, ImageError> {
        let total_len = response.content_length();
        self.check_declared_length(total_len)?;
        hooks.progress(0, total_len);

        let initial_capacity = total_len
            .map(|len| len.min(self.config.max_file_size).min(usize::MAX as u64) as usize)
            .filter(|len| *len > 0)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        let mut buffer = Vec::with_capacity(initial_capacity);
        let mut total: u64 = 0;
        let mut signature_checked = false;
        let mut received_first_chunk = false;

        loop {
            let read_timeout = if received_first_chunk {
                Duration::from_millis(self.config.stream_chunk_timeout_ms)
            } else {
                Duration::from_millis(self.config.stream_first_byte_timeout_ms)
            };

            let next_chunk = tokio::time::timeout(read_timeout, response.chunk())
                .await
                .map_err(|_| {
                    if received_first_chunk {
                        ImageError::fetch(uri, "下载数据流读取超时")
                    } else {
                        ImageError::fetch(uri, "下载首包超时")
                    }
                })?
                .map_err(|e| Self::map_reqwest_error(uri, e))?;

            let Some(chunk) = next_chunk else {
                break;
            };
            received_first_chunk = true;

            if hooks.is_cancelled() {
                return Err(ImageError::Cancelled("图片下载已取消".to_string()));
            }

            total = total.saturating_add(chunk.len() as u64);
            if total > self.config.max_file_size {
                return Err(ImageError::ResourceLimit("下载后文件超过大小限制".to_string()));
            }
            buffer.extend_from_slice(&chunk);
            hooks.progress(total, total_len);

            if !signature_checked {
                signature_checked = Self::probe_stream_signature(&buffer, STREAM_SIGNATURE_PROBE_BYTES)?;
            }
        }

        hooks.progress(total, total_len.or(Some(total)));
        Ok(Bytes::from(buffer))
    }

    /// 解析本地 / 应用相对路径。
    fn resolve_local_path(&self, uri: &str) -> PathBuf {
        let trimmed = uri.trim();

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "file://") {
            return PathBuf::from(rest);
        }

        for scheme in APP_RELATIVE_SCHEMES {
            if let Some(rest) = strip_prefix_ignore_case(trimmed, scheme) {
                return match &self.config.asset_root {
                    Some(root) => root.join(rest),
                    None => PathBuf::from(rest),
                };
            }
        }

        let path = PathBuf::from(trimmed);
        match &self.config.asset_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }

    /// 解析 data URI：第一个逗号之后为负载，`;base64` 头按标准 base64 解码。
    pub(crate) fn parse_data_uri(uri: &str, max_file_size: u64) -> Result<Vec<u8>, ImageError> {
        let normalized = uri.trim();
        let comma = normalized
            .find(',')
            .ok_or_else(|| ImageError::fetch("data:", "data URI 缺少逗号分隔的负载"))?;
        let header = normalized[..comma].to_ascii_lowercase();
        let payload = &normalized[comma + 1..];

        if !header.ends_with(";base64") {
            if payload.len() as u64 > max_file_size {
                return Err(ImageError::ResourceLimit("内联数据体积超过限制".to_string()));
            }
            return Ok(payload.as_bytes().to_vec());
        }

        let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let estimated_len = Self::estimate_base64_decoded_upper_bound_len(&compact)?;
        if estimated_len > max_file_size {
            return Err(ImageError::ResourceLimit(format!(
                "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
                estimated_len as f64 / 1024.0 / 1024.0,
                max_file_size as f64 / 1024.0 / 1024.0
            )));
        }

        general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| ImageError::fetch(&header, format!("Base64 解码失败：{}", e)))
    }

    fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, ImageError> {
        let groups = (base64_data.len() as u64)
            .checked_add(3)
            .ok_or_else(|| ImageError::ResourceLimit("Base64 输入长度溢出".to_string()))?
            / 4;

        groups
            .checked_mul(3)
            .ok_or_else(|| ImageError::ResourceLimit("Base64 解码体积估算溢出".to_string()))
    }

    fn check_declared_length(&self, declared: Option<u64>) -> Result<(), ImageError> {
        match declared {
            Some(size) if size > self.config.max_file_size => Err(ImageError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                size as f64 / 1024.0 / 1024.0,
                self.config.max_file_size as f64 / 1024.0 / 1024.0
            ))),
            _ => Ok(()),
        }
    }

    fn check_content_type(uri: &str, headers: &reqwest::header::HeaderMap) -> Result<(), ImageError> {
        let Some(content_type) = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        else {
            return Ok(());
        };

        if Self::is_image_content_type(content_type) || content_type.starts_with("application/octet-stream") {
            return Ok(());
        }

        Err(ImageError::fetch(uri, format!("不是图片类型：{}", content_type)))
    }

    fn retry_after_hint_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
        let value = headers.get(reqwest::header::RETRY_AFTER)?;
        let secs = value.to_str().ok()?.trim().parse::<u64>().ok()?;
        Some(secs.saturating_mul(1000).min(NETWORK_RETRY_MAX_DELAY_MS))
    }

    fn compute_retry_delay_with_jitter(attempt: u8, server_hint_ms: Option<u64>) -> u64 {
        let exp = NETWORK_RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << (attempt.saturating_sub(1).min(16) as u32));
        let base = server_hint_ms.unwrap_or(exp).min(NETWORK_RETRY_MAX_DELAY_MS);
        let jitter_bound = (base / 2).max(1);
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        base.saturating_add(seed % (jitter_bound + 1))
    }

    fn is_retryable_http_status(status: reqwest::StatusCode) -> bool {
        status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    fn is_retryable_network_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect()
    }

    fn is_image_content_type(content_type: &str) -> bool {
        content_type
            .split(';')
            .next()
            .map(|base| base.trim().to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }

    fn map_reqwest_error(uri: &str, error: reqwest::Error) -> ImageError {
        let cause = if error.is_timeout() {
            "请求超时".to_string()
        } else if error.is_connect() {
            format!("连接失败：{}", error.without_url())
        } else {
            format!("网络错误：{}", error.without_url())
        };
        ImageError::fetch(uri, cause)
    }

    /// 日志中去掉 query 与 fragment。
    pub(crate) fn redact_url_for_log(url: &str) -> String {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return "<invalid-url>".to_string();
        };

        let host = parsed.host_str().unwrap_or("<unknown-host>");
        let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
    }

    /// 通过文件签名（magic bytes）拒绝明显不是图片的内容。
    ///
    /// 无法识别的类型交给解码器判断。
    fn validate_image_signature(bytes: &[u8]) -> Result<(), ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::DecodeFailed("图片内容为空".to_string()));
        }

        match infer::get(bytes) {
            Some(kind) if kind.matcher_type() != infer::MatcherType::Image => Err(ImageError::DecodeFailed(
                format!("文件签名不是图片类型：{}", kind.mime_type()),
            )),
            _ => Ok(()),
        }
    }

    /// 流式下载阶段的签名探测。
    ///
    /// 返回值：
    /// - `Ok(true)`：已有结论（是图片，或探测字节已用完），不再探测
    /// - `Ok(false)`：当前字节不足以判断，继续下载
    /// - `Err(...)`：已识别为非图片
    fn probe_stream_signature(bytes: &[u8], probe_limit: usize) -> Result<bool, ImageError> {
        match infer::get(bytes) {
            Some(kind) if kind.matcher_type() != infer::MatcherType::Image => Err(ImageError::DecodeFailed(
                format!("下载内容不是图片类型：{}", kind.mime_type()),
            )),
            Some(_) => Ok(true),
            None => Ok(bytes.len() >= probe_limit),
        }
    }
}

impl Fetcher for UriFetcher {
    fn fetch<'a>(&'a self, uri: &'a str, hooks: FetchHooks) -> FetchFuture<'a> {
        Box::pin(self.fetch_uri(uri, hooks))
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

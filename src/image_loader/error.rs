//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载加载链路中的所有错误来源，避免字符串拼接式错误处理。
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! ## 错误分层
//!
//! - `InvalidArgument`：边界同步拒绝（空来源列表、非法缓冲），不会变成生命周期事件
//! - `FetchFailed` / `DecodeFailed` / `CompositeFailed` / `ResourceLimit`：
//!   单次加载内的失败，在流水线边界转换为 `LoadFailed` + `LoadEnd`
//! - `Cancelled`：被新请求取代后的协作式取消，永远不会对外发出

/// 图片加载统一错误类型。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("参数错误：{0}")]
    InvalidArgument(String),

    #[error("获取失败：{uri}（{cause}）")]
    FetchFailed { uri: String, cause: String },

    #[error("解码错误：{0}")]
    DecodeFailed(String),

    #[error("合成错误：{0}")]
    CompositeFailed(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("已取消：{0}")]
    Cancelled(String),
}

impl ImageError {
    /// 构造获取失败错误。
    pub(crate) fn fetch(uri: &str, cause: impl Into<String>) -> Self {
        Self::FetchFailed {
            uri: uri.to_string(),
            cause: cause.into(),
        }
    }

    /// 稳定错误码，随 `LoadFailed` 事件下发给宿主。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "E_INVALID_ARGUMENT",
            Self::FetchFailed { .. } => "E_FETCH",
            Self::DecodeFailed(_) => "E_DECODE",
            Self::CompositeFailed(_) => "E_COMPOSITE",
            Self::ResourceLimit(_) => "E_RESOURCE_LIMIT",
            Self::Cancelled(_) => "E_CANCELLED",
        }
    }

    /// 出错所在阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "validate",
            Self::FetchFailed { .. } => "fetch",
            Self::DecodeFailed(_) => "decode",
            Self::CompositeFailed(_) => "composite",
            Self::ResourceLimit(_) => "limit",
            Self::Cancelled(_) => "cancel",
        }
    }
}

impl From<ImageError> for String {
    fn from(error: ImageError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_stages_are_stable() {
        let err = ImageError::fetch("https://example.com/a.png", "HTTP 404");
        assert_eq!(err.code(), "E_FETCH");
        assert_eq!(err.stage(), "fetch");
        assert!(err.to_string().contains("HTTP 404"));

        assert_eq!(ImageError::CompositeFailed("x".into()).code(), "E_COMPOSITE");
        assert_eq!(ImageError::InvalidArgument("x".into()).stage(), "validate");
    }
}

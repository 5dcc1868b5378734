//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 加载核心内部统一使用 `ImageError`，跨越到应用层（命令行、宿主集成）时
//! 收敛为 `AppError`，调用方只需要处理一种错误类型。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ImageError` / `std::io::Error` 提供 `From` 转换，无需手动 map。
//! - 实现 `Serialize` 将错误序列化为字符串，便于 JSON 宿主直接透传。

use serde::Serialize;

use crate::image_loader::ImageError;

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 图片加载流水线错误（参数 / 获取 / 解码 / 合成）
    #[error("{0}")]
    Image(#[from] ImageError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 命令行用法错误
    #[error("参数错误: {0}")]
    Usage(String),
}

impl AppError {
    /// 进程退出码：用法错误为 2，其余为 1。
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

/// 将错误序列化为人类可读的字符串。
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

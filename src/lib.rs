//! # 自适应图片加载 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                宿主 UI 框架（视图 / 布局）                │
//! │                                                          │
//! │   属性变化 ── 布局完成 ── 视图卸载                       │
//! │       │                                                  │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↕ ImageViewService（Result<T, ImageError>）
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕            加载核心 (Rust)                       │
//! │                                                          │
//! │  ┌─ error ────── AppError (统一错误类型)                  │
//! │  │                                                       │
//! │  └─ image_loader                                         │
//! │      ├─ service     属性解析 / 宿主入口                   │
//! │      ├─ pipeline    视图状态 · 取代 · 编排               │
//! │      ├─ selector    多来源按面积选择                     │
//! │      ├─ loader      data URI / HTTP / 本地文件           │
//! │      ├─ decoder     image 解码 → BGRA8 预乘              │
//! │      ├─ compositor  着色 / 背景合成                      │
//! │      └─ events      生命周期事件 → EventSink             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，命令行与宿主集成的返回类型 |
//! | [`image_loader`] | 多来源选择、获取、解码、合成与生命周期事件 |

pub mod error;
pub mod image_loader;

//! # 自适应图片加载模块（image_loader）
//!
//! ## 设计思路
//!
//! 该模块把“来源选择 → 字节获取 → 解码 → 着色合成 → 生命周期事件”按职责拆分为多个子模块，
//! 宿主 UI 框架只通过 `service` / `pipeline` 与之交互，其余部分都可以单独测试。
//!
//! - `service`：宿主属性入口（强类型 + JSON）
//! - `pipeline`：每个视图的状态、取代判断与整条流水线编排
//! - `selector`：按目标面积挑选最接近的来源（纯函数）
//! - `loader`：data URI / 远程 / 本地来源的字节获取
//! - `decoder`：字节 → BGRA8 预乘像素，含资源上限
//! - `compositor`：着色与背景合成（纯函数）
//! - `events`：生命周期事件类型、发射器与接收端
//! - `config/error/source`：配置、错误、中间数据模型
//!
//! ## 实现思路
//!
//! 获取器、解码器、事件接收端与渲染表面都是 trait，默认实现基于 reqwest 与 image，
//! 宿主可以整体替换。流水线不持有任何 UI 句柄，只认 `ViewId`。
//!
//! ## 新同事快速上手
//!
//! 可以按下面顺序理解调用链：
//!
//! ```text
//! 宿主属性变化
//!    ↓
//! service.rs（属性解析与校验）
//!    ↓
//! pipeline.rs（视图状态 + generation + 阶段耗时日志）
//!    ├─ selector.rs（多来源选择）
//!    ├─ loader.rs（获取 + 签名校验）
//!    ├─ decoder.rs（解码 + 像素限制）
//!    └─ compositor.rs（着色 / 背景）
//!    ↓
//! events.rs（LoadStart → Downloading? → Load | LoadFailed → LoadEnd）
//! ```
//!
//! ## 分层职责建议
//!
//! - 新增属性或属性格式变化优先改 `service.rs`
//! - 配置项与默认值变更优先改 `config.rs`
//! - 取代 / 事件顺序问题优先看 `pipeline.rs` 与 `events.rs`
//! - 单阶段行为优化分别改 `loader/decoder/compositor`

pub mod compositor;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod loader;
pub mod pipeline;
pub mod selector;
pub mod service;
pub mod source;

#[cfg(test)]
mod test_support;

pub use compositor::composite;
pub use config::{FetchStrategy, ImageLoaderConfig};
pub use decoder::{ImageCrateDecoder, ImageDecoder};
pub use error::ImageError;
pub use events::{
    ChannelEventSink, EventSink, EventStreamShape, LifecycleEmitter, LifecycleEvent, LifecycleEventKind,
    RenderSurfaceSink,
};
pub use loader::{FetchFuture, FetchHooks, Fetcher, UriFetcher};
pub use pipeline::{AttemptHandle, AttemptOutcome, LoadPhase, LoadPipeline};
pub use selector::{select, select_from_set};
pub use service::{ImageViewService, SourceProp};
pub use source::{
    Color, ColorSpec, ImageMetadata, ImageSource, ImageSourceSet, PixelBuffer, RawImageData, SourceKind,
    TargetSize, ViewId,
};

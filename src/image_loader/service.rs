//! # 服务层（宿主入口）
//!
//! ## 设计思路
//!
//! 宿主 UI 框架只关心“属性变化”：来源、尺寸、颜色、卸载。
//! `ImageViewService` 把这些入站调用适配到 `LoadPipeline`，
//! 流水线本身不需要知道属性从哪里来。
//!
//! ## 实现思路
//!
//! - 强类型入口：`set_single_source` / `set_multiple_sources` / `set_target_size` / `set_colors` / `drop_view`
//! - JSON 入口：`apply_props` 先完整解析并校验，全部合法后才修改视图状态，
//!   非法属性返回 `InvalidArgument`，视图保持原样
//! - 颜色接受 `#RRGGBB`、`#RRGGBBAA` 或 ARGB 整数；`null` 表示清除

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::events::{EventSink, RenderSurfaceSink};
use super::pipeline::{AttemptHandle, LoadPipeline};
use super::source::{Color, ColorSpec, ImageSource, TargetSize, ViewId};
use super::{ImageError, ImageLoaderConfig};

/// 宿主声明的单个来源属性。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceProp {
    pub uri: String,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

impl SourceProp {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            width: None,
            height: None,
        }
    }

    pub fn sized(uri: impl Into<String>, width: f64, height: f64) -> Self {
        Self {
            uri: uri.into(),
            width: Some(width),
            height: Some(height),
        }
    }
}

impl From<SourceProp> for ImageSource {
    /// 宽高任一缺省时面积视为未设置。
    fn from(prop: SourceProp) -> Self {
        match (prop.width, prop.height) {
            (Some(width), Some(height)) => ImageSource::with_size(prop.uri, width, height),
            _ => ImageSource::new(prop.uri),
        }
    }
}

/// 图片视图服务。
pub struct ImageViewService {
    pipeline: LoadPipeline,
}

impl ImageViewService {
    /// 使用默认获取器与解码器创建服务，必须在 tokio 运行时内调用。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use adaptive_image_loader::image_loader::{
    ///     ChannelEventSink, ImageLoaderConfig, ImageViewService, PixelBuffer, RenderSurfaceSink, ViewId,
    /// };
    ///
    /// struct NullSurface;
    /// impl RenderSurfaceSink for NullSurface {
    ///     fn set_image(&self, _view_id: ViewId, _bitmap: PixelBuffer) {}
    /// }
    ///
    /// # async fn demo() -> Result<(), adaptive_image_loader::image_loader::ImageError> {
    /// let (events, _receiver) = ChannelEventSink::new();
    /// let service = ImageViewService::new(ImageLoaderConfig::default(), Arc::new(events), Arc::new(NullSurface))?;
    /// service.apply_props(ViewId(1), &serde_json::json!({ "source": "https://example.com/a.png" }))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        config: ImageLoaderConfig,
        events: Arc<dyn EventSink>,
        surface: Arc<dyn RenderSurfaceSink>,
    ) -> Result<Self, ImageError> {
        Ok(Self::with_pipeline(LoadPipeline::new(config, events, surface)?))
    }

    pub fn with_pipeline(pipeline: LoadPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &LoadPipeline {
        &self.pipeline
    }

    pub fn set_single_source(&self, view_id: ViewId, uri: &str) -> Result<AttemptHandle, ImageError> {
        self.pipeline.request_single(view_id, uri, None)
    }

    /// 保存候选来源，沿用视图已记录的目标尺寸。
    pub fn set_multiple_sources(
        &self,
        view_id: ViewId,
        sources: Vec<SourceProp>,
    ) -> Result<Option<AttemptHandle>, ImageError> {
        let target = self.pipeline.target_size(view_id).unwrap_or_default();
        let sources = sources.into_iter().map(ImageSource::from).collect();
        self.pipeline.request_multiple(view_id, sources, target, None)
    }

    pub fn set_target_size(&self, view_id: ViewId, width: f64, height: f64) -> Option<AttemptHandle> {
        self.pipeline
            .on_target_size_resolved(view_id, TargetSize::new(width, height))
    }

    pub fn set_colors(
        &self,
        view_id: ViewId,
        tint: Option<Color>,
        background: Option<Color>,
    ) -> Option<AttemptHandle> {
        self.pipeline
            .set_colors(view_id, ColorSpec::new(tint, background))
    }

    pub fn drop_view(&self, view_id: ViewId) -> bool {
        self.pipeline.drop_view(view_id)
    }

    /// 应用一组 JSON 属性。
    ///
    /// 支持的键：`source`（字符串 / 对象 / 数组）、`sources`（数组）、`width` + `height`、
    /// `tintColor`、`backgroundColor`。返回最后启动的加载（如有）。
    pub fn apply_props(&self, view_id: ViewId, props: &Value) -> Result<Option<AttemptHandle>, ImageError> {
        let parsed = ViewProps::parse(props)?;
        let current = self.pipeline.colors(view_id).unwrap_or_default();
        let colors = ColorSpec::new(
            parsed.tint.unwrap_or(current.tint),
            parsed.background.unwrap_or(current.background),
        );

        log::debug!(
            "🧩 应用视图属性 - {} 来源: {} 尺寸: {} 颜色变化: {}",
            view_id,
            parsed.sources.as_ref().map_or("无", SourcesProp::label),
            parsed.target.is_some(),
            colors != current
        );

        match parsed.sources {
            Some(SourcesProp::Single(source)) => {
                if let Some(target) = parsed.target {
                    self.pipeline.on_target_size_resolved(view_id, target);
                }
                self.pipeline
                    .request_single(view_id, &source.uri, Some(colors))
                    .map(Some)
            }
            Some(SourcesProp::Multiple(sources)) => {
                let target = parsed
                    .target
                    .or_else(|| self.pipeline.target_size(view_id))
                    .unwrap_or_default();
                let sources = sources.into_iter().map(ImageSource::from).collect();
                self.pipeline
                    .request_multiple(view_id, sources, target, Some(colors))
            }
            None => {
                let recolored = if colors != current {
                    self.pipeline.set_colors(view_id, colors)
                } else {
                    None
                };
                let reselected = parsed
                    .target
                    .and_then(|target| self.pipeline.on_target_size_resolved(view_id, target));
                Ok(reselected.or(recolored))
            }
        }
    }
}

#[derive(Debug)]
enum SourcesProp {
    Single(SourceProp),
    Multiple(Vec<SourceProp>),
}

impl SourcesProp {
    fn label(&self) -> &'static str {
        match self {
            Self::Single(_) => "单一",
            Self::Multiple(_) => "多个",
        }
    }
}

/// 已校验的属性集合；外层 `Option` 表示“未出现”，内层 `None` 表示清除颜色。
#[derive(Debug, Default)]
struct ViewProps {
    sources: Option<SourcesProp>,
    target: Option<TargetSize>,
    tint: Option<Option<Color>>,
    background: Option<Option<Color>>,
}

impl ViewProps {
    fn parse(props: &Value) -> Result<Self, ImageError> {
        let map = props
            .as_object()
            .ok_or_else(|| ImageError::InvalidArgument("视图属性必须是 JSON 对象".to_string()))?;

        let sources = match (map.get("source"), map.get("sources")) {
            (Some(_), Some(_)) => {
                return Err(ImageError::InvalidArgument(
                    "source 与 sources 不能同时设置".to_string(),
                ));
            }
            (Some(value), None) => Some(parse_source_value(value)?),
            (None, Some(value)) => Some(SourcesProp::Multiple(parse_source_list(value)?)),
            (None, None) => None,
        };

        Ok(Self {
            sources,
            target: parse_target(map)?,
            tint: parse_color_key(map, "tintColor")?,
            background: parse_color_key(map, "backgroundColor")?,
        })
    }
}

fn parse_source_value(value: &Value) -> Result<SourcesProp, ImageError> {
    match value {
        Value::Array(_) => Ok(SourcesProp::Multiple(parse_source_list(value)?)),
        other => Ok(SourcesProp::Single(parse_source_entry(other)?)),
    }
}

fn parse_source_list(value: &Value) -> Result<Vec<SourceProp>, ImageError> {
    let items = value
        .as_array()
        .ok_or_else(|| ImageError::InvalidArgument("sources 必须是数组".to_string()))?;
    if items.is_empty() {
        return Err(ImageError::InvalidArgument("来源列表不能为空".to_string()));
    }

    items.iter().map(parse_source_entry).collect()
}

fn parse_source_entry(value: &Value) -> Result<SourceProp, ImageError> {
    match value {
        Value::String(uri) => Ok(SourceProp::new(uri.clone())),
        Value::Object(_) => serde_json::from_value(value.clone())
            .map_err(|e| ImageError::InvalidArgument(format!("来源属性格式错误：{}", e))),
        other => Err(ImageError::InvalidArgument(format!("不支持的来源属性：{}", other))),
    }
}

fn parse_target(map: &Map<String, Value>) -> Result<Option<TargetSize>, ImageError> {
    let dimension = |key: &str| -> Result<Option<f64>, ImageError> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| ImageError::InvalidArgument(format!("{} 必须是数字", key))),
        }
    };

    match (dimension("width")?, dimension("height")?) {
        (Some(width), Some(height)) => Ok(Some(TargetSize::new(width, height))),
        (None, None) => Ok(None),
        _ => Err(ImageError::InvalidArgument("width 与 height 必须同时设置".to_string())),
    }
}

fn parse_color_key(map: &Map<String, Value>, key: &str) -> Result<Option<Option<Color>>, ImageError> {
    match map.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(text)) => Color::parse_hex(text).map(|c| Some(Some(c))),
        Some(Value::Number(number)) => number
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(|argb| Some(Some(Color::from_argb(argb))))
            .ok_or_else(|| ImageError::InvalidArgument(format!("{} 不是合法的 ARGB 数值：{}", key, number))),
        Some(other) => Err(ImageError::InvalidArgument(format!("{} 格式错误：{}", key, other))),
    }
}

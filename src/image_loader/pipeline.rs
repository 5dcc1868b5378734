//! # 核心编排模块
//!
//! ## 设计思路
//!
//! `LoadPipeline` 只负责流程编排与每个视图的状态管理，不直接与任何 UI 框架绑定。
//! 单次加载的链路固定为：
//! 1. 选择来源（多来源时）
//! 2. 获取原始字节
//! 3. 解码为 BGRA 像素
//! 4. 按需着色 / 背景合成
//! 5. 交给渲染表面并发出生命周期事件
//!
//! ## 实现思路
//!
//! - 每个视图一把独立的锁（`Arc<Mutex<ViewSlot>>`），外层 `RwLock<HashMap>` 只在挂载 / 卸载视图时写锁，
//!   不同视图之间互不竞争。
//! - 每次请求从全局递增计数器领取 generation；完成时 generation 不匹配即视为被取代，结果直接丢弃。
//! - 事件先缓存在发射器中，只在检查点（首个进度、获取完成、终态）确认仍为最新请求时，
//!   在视图锁内派发，因此被取代的加载不会再发出任何事件。
//! - 获取 / 解码 / 合成中的任何错误都在这里被截获并转换为 `LoadFailed` + `LoadEnd`，不会抛给宿主。
//! - 记录 `fetch/decode/composite/total` 阶段耗时，便于性能诊断。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::compositor::composite;
use super::decoder::{ImageCrateDecoder, ImageDecoder};
use super::events::{EventSink, LifecycleEmitter, RenderSurfaceSink};
use super::loader::{FetchHooks, Fetcher, UriFetcher};
use super::selector::select_from_set;
use super::source::{
    ColorSpec, ImageMetadata, ImageSource, ImageSourceSet, SourceKind, TargetSize, ViewId,
};
use super::{ImageError, ImageLoaderConfig};

/// 视图当前所处阶段。`Ready` / `Failed` 与 `Idle` 一样可以接受新请求。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPhase {
    #[default]
    Idle,
    Requesting,
    Fetching,
    Decoding,
    Compositing,
    Ready,
    Failed,
}

impl LoadPhase {
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Requesting | Self::Fetching | Self::Decoding | Self::Compositing
        )
    }
}

/// 单次加载的最终结果。
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Loaded(ImageMetadata),
    Failed(ImageError),
    /// 被同一视图的新请求取代（或视图已卸载），没有发出终态事件。
    Superseded,
}

/// 已启动加载的句柄。丢弃句柄不会取消加载。
#[derive(Debug)]
pub struct AttemptHandle {
    view_id: ViewId,
    generation: u64,
    uri: String,
    join: JoinHandle<AttemptOutcome>,
}

impl AttemptHandle {
    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// 等待加载结束。
    pub async fn wait(self) -> AttemptOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("❌ 加载任务异常终止 - {} uri={}：{}", self.view_id, self.uri, err);
                AttemptOutcome::Failed(ImageError::DecodeFailed(format!("加载任务异常终止：{}", err)))
            }
        }
    }
}

#[derive(Debug, Default)]
struct ViewSlot {
    sources: Option<ImageSourceSet>,
    target: TargetSize,
    colors: ColorSpec,
    generation: u64,
    phase: LoadPhase,
    current_uri: Option<String>,
}

struct PipelineShared {
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn ImageDecoder>,
    events: Arc<dyn EventSink>,
    surface: Arc<dyn RenderSurfaceSink>,
    views: RwLock<HashMap<ViewId, Arc<Mutex<ViewSlot>>>>,
    next_generation: AtomicU64,
}

/// 自适应图片加载流水线。
///
/// 克隆开销很小，克隆体共享同一份视图状态。
#[derive(Clone)]
pub struct LoadPipeline {
    shared: Arc<PipelineShared>,
    runtime: Handle,
}

impl LoadPipeline {
    /// 使用默认获取器与解码器创建流水线，必须在 tokio 运行时内调用。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use adaptive_image_loader::image_loader::{
    ///     ChannelEventSink, ImageLoaderConfig, LoadPipeline, PixelBuffer, RenderSurfaceSink, ViewId,
    /// };
    ///
    /// struct NullSurface;
    /// impl RenderSurfaceSink for NullSurface {
    ///     fn set_image(&self, _view_id: ViewId, _bitmap: PixelBuffer) {}
    /// }
    ///
    /// # async fn demo() -> Result<(), adaptive_image_loader::image_loader::ImageError> {
    /// let (events, mut receiver) = ChannelEventSink::new();
    /// let pipeline = LoadPipeline::new(ImageLoaderConfig::default(), Arc::new(events), Arc::new(NullSurface))?;
    /// let attempt = pipeline.request_single(ViewId(1), "https://example.com/a.png", None)?;
    /// let _outcome = attempt.wait().await;
    /// while let Ok(event) = receiver.try_recv() {
    ///     println!("{:?}", event.kind);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        config: ImageLoaderConfig,
        events: Arc<dyn EventSink>,
        surface: Arc<dyn RenderSurfaceSink>,
    ) -> Result<Self, ImageError> {
        let runtime = Handle::try_current().map_err(|_| {
            ImageError::InvalidArgument("必须在 tokio 运行时内创建加载流水线".to_string())
        })?;
        let decoder = Arc::new(ImageCrateDecoder::new(&config));
        let fetcher = Arc::new(UriFetcher::new(config)?);

        Ok(Self::with_collaborators(fetcher, decoder, events, surface, runtime))
    }

    /// 注入宿主提供的获取器 / 解码器 / 事件与渲染接收端。
    pub fn with_collaborators(
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn ImageDecoder>,
        events: Arc<dyn EventSink>,
        surface: Arc<dyn RenderSurfaceSink>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                fetcher,
                decoder,
                events,
                surface,
                views: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
            runtime,
        }
    }

    /// 加载单一 URI，清除该视图已保存的多来源集合。
    ///
    /// `colors` 为 `None` 时沿用视图已保存的颜色。
    pub fn request_single(
        &self,
        view_id: ViewId,
        uri: &str,
        colors: Option<ColorSpec>,
    ) -> Result<AttemptHandle, ImageError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ImageError::InvalidArgument("URI 不能为空".to_string()));
        }

        let slot = self.shared.slot_or_insert(view_id);
        let mut slot = lock(&slot);
        slot.sources = None;
        if let Some(colors) = colors {
            slot.colors = colors;
        }

        Ok(self.start_attempt_locked(view_id, &mut slot, uri.to_string()))
    }

    /// 保存候选来源；目标尺寸未解析且有多个来源时只保存不加载，返回 `Ok(None)`。
    pub fn request_multiple(
        &self,
        view_id: ViewId,
        sources: Vec<ImageSource>,
        target: TargetSize,
        colors: Option<ColorSpec>,
    ) -> Result<Option<AttemptHandle>, ImageError> {
        let sources = ImageSourceSet::new(sources)?;

        let slot = self.shared.slot_or_insert(view_id);
        let mut slot = lock(&slot);
        slot.sources = Some(sources);
        slot.target = target;
        if let Some(colors) = colors {
            slot.colors = colors;
        }

        Ok(self.select_and_start_locked(view_id, &mut slot, false))
    }

    /// 布局完成后用已保存的来源重新选择；没有保存来源时只记录尺寸，不加载。
    ///
    /// 选中的 URI 与当前显示 / 加载中的相同时不会重新加载。
    pub fn on_target_size_resolved(&self, view_id: ViewId, target: TargetSize) -> Option<AttemptHandle> {
        let slot = self.shared.slot_or_insert(view_id);
        let mut slot = lock(&slot);
        slot.target = target;

        self.select_and_start_locked(view_id, &mut slot, true)
    }

    /// 更新视图颜色，并用新颜色重新加载当前 URI。
    pub fn set_colors(&self, view_id: ViewId, colors: ColorSpec) -> Option<AttemptHandle> {
        let slot = self.shared.slot_or_insert(view_id);
        let mut slot = lock(&slot);
        if slot.colors == colors {
            return None;
        }
        slot.colors = colors;

        let uri = slot.current_uri.clone()?;
        Some(self.start_attempt_locked(view_id, &mut slot, uri))
    }

    /// 卸载视图：移除其状态，之后该视图所有进行中的加载结果都会被丢弃。
    pub fn drop_view(&self, view_id: ViewId) -> bool {
        let removed = self
            .shared
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&view_id);

        match removed {
            Some(slot) => {
                let mut slot = lock(&slot);
                slot.generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
                slot.sources = None;
                log::debug!("🗑️ 视图已卸载 - {}（进行中加载: {}）", view_id, slot.phase.is_in_flight());
                true
            }
            None => false,
        }
    }

    pub fn phase(&self, view_id: ViewId) -> Option<LoadPhase> {
        self.shared.slot(view_id).map(|slot| lock(&slot).phase)
    }

    pub fn target_size(&self, view_id: ViewId) -> Option<TargetSize> {
        self.shared.slot(view_id).map(|slot| lock(&slot).target)
    }

    pub fn colors(&self, view_id: ViewId) -> Option<ColorSpec> {
        self.shared.slot(view_id).map(|slot| lock(&slot).colors)
    }

    pub fn view_count(&self) -> usize {
        self.shared
            .views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn select_and_start_locked(
        &self,
        view_id: ViewId,
        slot: &mut ViewSlot,
        skip_if_unchanged: bool,
    ) -> Option<AttemptHandle> {
        let sources = slot.sources.as_ref()?;

        if sources.len() > 1 && !slot.target.is_resolved() {
            log::debug!("⏳ 目标尺寸未解析，延迟选择 - {}（{} 个来源）", view_id, sources.len());
            return None;
        }

        let chosen = match select_from_set(sources, slot.target) {
            Ok(source) => source.uri.clone(),
            Err(err) => {
                log::error!("❌ 来源选择失败 - {}：{}", view_id, err);
                return None;
            }
        };

        if skip_if_unchanged
            && slot.phase != LoadPhase::Failed
            && slot.current_uri.as_deref() == Some(chosen.as_str())
        {
            return None;
        }

        Some(self.start_attempt_locked(view_id, slot, chosen))
    }

    fn start_attempt_locked(&self, view_id: ViewId, slot: &mut ViewSlot, uri: String) -> AttemptHandle {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        if slot.phase.is_in_flight() {
            log::debug!(
                "↩️ 取代进行中的加载 - {} generation {} -> {}",
                view_id,
                slot.generation,
                generation
            );
        }

        slot.generation = generation;
        slot.phase = LoadPhase::Requesting;
        slot.current_uri = Some(uri.clone());

        let shared = Arc::clone(&self.shared);
        let colors = slot.colors;
        let task_uri = uri.clone();
        let join = self
            .runtime
            .spawn(async move { shared.run_attempt(view_id, generation, task_uri, colors).await });

        AttemptHandle {
            view_id,
            generation,
            uri,
            join,
        }
    }
}

impl PipelineShared {
    fn slot(&self, view_id: ViewId) -> Option<Arc<Mutex<ViewSlot>>> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&view_id)
            .cloned()
    }

    fn slot_or_insert(&self, view_id: ViewId) -> Arc<Mutex<ViewSlot>> {
        if let Some(slot) = self.slot(view_id) {
            return slot;
        }

        let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(views.entry(view_id).or_insert_with(|| {
            log::debug!("➕ 视图已挂载 - {}", view_id);
            Arc::new(Mutex::new(ViewSlot::default()))
        }))
    }

    fn is_current(&self, view_id: ViewId, generation: u64) -> bool {
        self.slot(view_id)
            .is_some_and(|slot| lock(&slot).generation == generation)
    }

    /// 仅当该次加载仍是视图最新请求时，在视图锁内执行 `f`。
    fn with_current<R>(
        &self,
        view_id: ViewId,
        generation: u64,
        f: impl FnOnce(&mut ViewSlot) -> R,
    ) -> Option<R> {
        let slot = self.slot(view_id)?;
        let mut slot = lock(&slot);
        if slot.generation != generation {
            return None;
        }
        Some(f(&mut slot))
    }

    /// 检查点：更新阶段，`flush` 时派发缓存事件。被取代则丢弃发射器并返回 `false`。
    fn checkpoint(
        &self,
        view_id: ViewId,
        generation: u64,
        phase: LoadPhase,
        emitter: &Mutex<LifecycleEmitter>,
        flush: bool,
    ) -> bool {
        let current = self
            .with_current(view_id, generation, |slot| {
                slot.phase = phase;
                if flush {
                    self.dispatch_pending(emitter);
                }
            })
            .is_some();

        if !current {
            lock(emitter).discard();
        }
        current
    }

    fn dispatch_pending(&self, emitter: &Mutex<LifecycleEmitter>) {
        for event in lock(emitter).drain() {
            self.events.dispatch(event);
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        view_id: ViewId,
        generation: u64,
        uri: String,
        colors: ColorSpec,
    ) -> AttemptOutcome {
        let emitter = if colors.is_empty() && SourceKind::from_uri(&uri) == SourceKind::Remote {
            LifecycleEmitter::progress_driven(view_id, uri.clone())
        } else {
            LifecycleEmitter::decode_driven(view_id, uri.clone())
        };
        let emitter = Arc::new(Mutex::new(emitter));
        lock(&emitter).load_start();

        let total_start = Instant::now();
        if !self.checkpoint(view_id, generation, LoadPhase::Fetching, &emitter, false) {
            return self.superseded(view_id, generation, &uri);
        }

        let hooks = {
            let progress_shared = Arc::clone(&self);
            let progress_emitter = Arc::clone(&emitter);
            let announced = AtomicBool::new(false);
            let cancel_shared = Arc::clone(&self);

            FetchHooks::new(
                move |_, _| {
                    if announced.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    lock(&progress_emitter).downloading();
                    progress_shared.checkpoint(
                        view_id,
                        generation,
                        LoadPhase::Fetching,
                        &progress_emitter,
                        true,
                    );
                },
                move || !cancel_shared.is_current(view_id, generation),
            )
        };

        let fetch_start = Instant::now();
        let fetched = self.fetcher.fetch(&uri, hooks).await;
        let fetch_elapsed = fetch_start.elapsed();

        let raw = match fetched {
            Ok(raw) => raw,
            Err(err) => return self.finish_failed(view_id, generation, &uri, &emitter, err),
        };

        if !self.checkpoint(view_id, generation, LoadPhase::Decoding, &emitter, true) {
            return self.superseded(view_id, generation, &uri);
        }

        let decode_start = Instant::now();
        let decoder = Arc::clone(&self.decoder);
        let source_hint = raw.source_hint;
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&raw.bytes)).await;
        let buffer = match decoded {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(err)) => return self.finish_failed(view_id, generation, &uri, &emitter, err),
            Err(join_err) => {
                let err = ImageError::DecodeFailed(format!("解码任务异常终止：{}", join_err));
                return self.finish_failed(view_id, generation, &uri, &emitter, err);
            }
        };
        let decode_elapsed = decode_start.elapsed();

        let composite_start = Instant::now();
        let bitmap = if colors.is_empty() {
            buffer
        } else {
            if !self.checkpoint(view_id, generation, LoadPhase::Compositing, &emitter, false) {
                return self.superseded(view_id, generation, &uri);
            }

            let composited = tokio::task::spawn_blocking(move || {
                composite(&buffer, colors.tint, colors.background)
            })
            .await;

            match composited {
                Ok(Ok(bitmap)) => bitmap,
                Ok(Err(err)) => {
                    let err = ImageError::CompositeFailed(err.to_string());
                    return self.finish_failed(view_id, generation, &uri, &emitter, err);
                }
                Err(join_err) => {
                    let err = ImageError::CompositeFailed(format!("合成任务异常终止：{}", join_err));
                    return self.finish_failed(view_id, generation, &uri, &emitter, err);
                }
            }
        };
        let composite_elapsed = composite_start.elapsed();

        let metadata = ImageMetadata {
            uri: uri.clone(),
            pixel_width: bitmap.width,
            pixel_height: bitmap.height,
        };

        let committed = self.with_current(view_id, generation, |slot| {
            self.surface.set_image(view_id, bitmap);
            lock(&emitter).succeed(metadata.clone());
            self.dispatch_pending(&emitter);
            slot.phase = LoadPhase::Ready;
        });

        if committed.is_none() {
            lock(&emitter).discard();
            return self.superseded(view_id, generation, &uri);
        }

        log::info!(
            "✅ 图片加载完成 - {} 来源: {} 尺寸: {}x{} fetch={}ms decode={}ms composite={}ms total={}ms",
            view_id,
            source_hint,
            metadata.pixel_width,
            metadata.pixel_height,
            fetch_elapsed.as_millis(),
            decode_elapsed.as_millis(),
            composite_elapsed.as_millis(),
            total_start.elapsed().as_millis()
        );

        AttemptOutcome::Loaded(metadata)
    }

    fn finish_failed(
        &self,
        view_id: ViewId,
        generation: u64,
        uri: &str,
        emitter: &Mutex<LifecycleEmitter>,
        err: ImageError,
    ) -> AttemptOutcome {
        let reported = self.with_current(view_id, generation, |slot| {
            lock(emitter).fail(&err);
            self.dispatch_pending(emitter);
            slot.phase = LoadPhase::Failed;
        });

        if reported.is_none() {
            lock(emitter).discard();
            return self.superseded(view_id, generation, uri);
        }

        log::warn!(
            "⚠️ 图片加载失败 - {} uri={} [{}] {}",
            view_id,
            redact_for_log(uri),
            err.code(),
            err
        );
        AttemptOutcome::Failed(err)
    }

    fn superseded(&self, view_id: ViewId, generation: u64, uri: &str) -> AttemptOutcome {
        log::debug!(
            "🚫 丢弃过期加载结果 - {} generation {} uri={}",
            view_id,
            generation,
            redact_for_log(uri)
        );
        AttemptOutcome::Superseded
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn redact_for_log(uri: &str) -> String {
    match SourceKind::from_uri(uri) {
        SourceKind::Remote => UriFetcher::redact_url_for_log(uri),
        SourceKind::Inline => format!("data:…（{} 字符）", uri.len()),
        SourceKind::Local => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_loader::events::{LifecycleEvent, LifecycleEventKind};
    use crate::image_loader::loader::FetchFuture;
    use crate::image_loader::source::{Color, PixelBuffer, RawImageData};
    use crate::image_loader::test_support::png_bytes;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct StubFetcher {
        responses: Mutex<HashMap<String, Result<Vec<u8>, ImageError>>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn respond(&self, uri: &str, result: Result<Vec<u8>, ImageError>) {
            lock(&self.responses).insert(uri.to_string(), result);
        }

        fn gate(&self, uri: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            lock(&self.gates).insert(uri.to_string(), Arc::clone(&gate));
            gate
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for StubFetcher {
        fn fetch<'a>(&'a self, uri: &'a str, hooks: FetchHooks) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if SourceKind::from_uri(uri) == SourceKind::Remote {
                    hooks.progress(0, None);
                }

                let gate = lock(&self.gates).get(uri).cloned();
                if let Some(gate) = gate {
                    gate.notified().await;
                }

                let result = lock(&self.responses)
                    .get(uri)
                    .cloned()
                    .unwrap_or_else(|| Err(ImageError::fetch(uri, "HTTP 404")));
                result.map(|bytes| RawImageData {
                    bytes: Bytes::from(bytes),
                    source_hint: "stub",
                })
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<LifecycleEvent> {
            lock(&self.events).clone()
        }

        fn kinds_for(&self, uri: &str) -> Vec<LifecycleEventKind> {
            self.events()
                .into_iter()
                .filter(|e| e.uri == uri)
                .map(|e| e.kind)
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn dispatch(&self, event: LifecycleEvent) {
            lock(&self.events).push(event);
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        images: Mutex<Vec<(ViewId, PixelBuffer)>>,
    }

    impl RenderSurfaceSink for RecordingSurface {
        fn set_image(&self, view_id: ViewId, bitmap: PixelBuffer) {
            lock(&self.images).push((view_id, bitmap));
        }
    }

    struct Harness {
        pipeline: LoadPipeline,
        fetcher: Arc<StubFetcher>,
        sink: Arc<RecordingSink>,
        surface: Arc<RecordingSurface>,
    }

    fn harness() -> Harness {
        let fetcher = Arc::new(StubFetcher::default());
        let sink = Arc::new(RecordingSink::default());
        let surface = Arc::new(RecordingSurface::default());
        let pipeline = LoadPipeline::with_collaborators(
            fetcher.clone(),
            Arc::new(ImageCrateDecoder::default()),
            sink.clone(),
            surface.clone(),
            Handle::current(),
        );

        Harness {
            pipeline,
            fetcher,
            sink,
            surface,
        }
    }

    fn loaded(uri: &str, width: u32, height: u32) -> LifecycleEventKind {
        LifecycleEventKind::Load {
            metadata: ImageMetadata {
                uri: uri.to_string(),
                pixel_width: width,
                pixel_height: height,
            },
        }
    }

    const LOCAL_A: &str = "assets/a.png";
    const LOCAL_B: &str = "assets/b.png";
    const REMOTE: &str = "https://cdn.example.com/photo.png";

    #[tokio::test]
    async fn single_request_emits_start_load_end() {
        let h = harness();
        h.fetcher.respond(LOCAL_A, Ok(png_bytes(3, 2, [1, 2, 3, 255])));

        let outcome = h
            .pipeline
            .request_single(ViewId(1), LOCAL_A, None)
            .expect("request accepted")
            .wait()
            .await;

        assert!(matches!(outcome, AttemptOutcome::Loaded(ref m) if m.pixel_width == 3));
        assert_eq!(
            h.sink.kinds_for(LOCAL_A),
            vec![LifecycleEventKind::LoadStart, loaded(LOCAL_A, 3, 2), LifecycleEventKind::LoadEnd]
        );
        assert_eq!(h.pipeline.phase(ViewId(1)), Some(LoadPhase::Ready));

        let images = lock(&h.surface.images);
        assert_eq!(images.len(), 1);
        assert_eq!(&images[0].1.bytes[..4], &[3, 2, 1, 255]);
    }

    #[tokio::test]
    async fn remote_request_without_colors_reports_downloading() {
        let h = harness();
        h.fetcher.respond(REMOTE, Ok(png_bytes(2, 2, [0, 0, 0, 255])));

        h.pipeline
            .request_single(ViewId(1), REMOTE, None)
            .expect("request accepted")
            .wait()
            .await;

        assert_eq!(
            h.sink.kinds_for(REMOTE),
            vec![
                LifecycleEventKind::LoadStart,
                LifecycleEventKind::Downloading,
                loaded(REMOTE, 2, 2),
                LifecycleEventKind::LoadEnd,
            ]
        );
    }

    #[tokio::test]
    async fn colored_request_composites_and_uses_decode_driven_stream() {
        let h = harness();
        h.fetcher.respond(REMOTE, Ok(png_bytes(1, 1, [9, 9, 9, 255])));

        let colors = ColorSpec::new(Some(Color::rgba(200, 100, 50, 255)), None);
        h.pipeline
            .request_single(ViewId(1), REMOTE, Some(colors))
            .expect("request accepted")
            .wait()
            .await;

        assert_eq!(
            h.sink.kinds_for(REMOTE),
            vec![LifecycleEventKind::LoadStart, loaded(REMOTE, 1, 1), LifecycleEventKind::LoadEnd]
        );
        assert_eq!(lock(&h.surface.images)[0].1.bytes, vec![50, 100, 200, 255]);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_and_view_accepts_new_requests() {
        let h = harness();
        h.fetcher.respond(LOCAL_A, Err(ImageError::fetch(LOCAL_A, "HTTP 500")));
        h.fetcher.respond(LOCAL_B, Ok(png_bytes(1, 1, [0, 0, 0, 255])));

        let outcome = h
            .pipeline
            .request_single(ViewId(1), LOCAL_A, None)
            .expect("request accepted")
            .wait()
            .await;

        assert!(matches!(outcome, AttemptOutcome::Failed(ImageError::FetchFailed { .. })));
        let kinds = h.sink.kinds_for(LOCAL_A);
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[1], LifecycleEventKind::LoadFailed { code: "E_FETCH", .. }));
        assert!(kinds[2].is_terminal());
        assert_eq!(h.pipeline.phase(ViewId(1)), Some(LoadPhase::Failed));
        assert!(lock(&h.surface.images).is_empty());

        let outcome = h
            .pipeline
            .request_single(ViewId(1), LOCAL_B, None)
            .expect("request accepted")
            .wait()
            .await;
        assert!(matches!(outcome, AttemptOutcome::Loaded(_)));
    }

    #[tokio::test]
    async fn decode_failure_is_reported_as_load_failed() {
        let h = harness();
        h.fetcher.respond(LOCAL_A, Ok(b"not an image at all".to_vec()));

        let outcome = h
            .pipeline
            .request_single(ViewId(2), LOCAL_A, None)
            .expect("request accepted")
            .wait()
            .await;

        assert!(matches!(outcome, AttemptOutcome::Failed(ImageError::DecodeFailed(_))));
        let kinds = h.sink.kinds_for(LOCAL_A);
        assert!(matches!(kinds[1], LifecycleEventKind::LoadFailed { code: "E_DECODE", .. }));
        assert_eq!(kinds.last(), Some(&LifecycleEventKind::LoadEnd));
    }

    #[tokio::test]
    async fn later_request_supersedes_pending_one() {
        let h = harness();
        h.fetcher.respond(LOCAL_A, Ok(png_bytes(1, 1, [1, 1, 1, 255])));
        h.fetcher.respond(LOCAL_B, Ok(png_bytes(2, 2, [2, 2, 2, 255])));
        let gate_a = h.fetcher.gate(LOCAL_A);

        let first = h.pipeline.request_single(ViewId(1), LOCAL_A, None).expect("request A");
        for _ in 0..100 {
            if h.fetcher.calls() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.pipeline.phase(ViewId(1)), Some(LoadPhase::Fetching));

        let second = h.pipeline.request_single(ViewId(1), LOCAL_B, None).expect("request B");
        assert!(second.generation() > first.generation());

        assert!(matches!(second.wait().await, AttemptOutcome::Loaded(_)));
        gate_a.notify_one();
        assert_eq!(first.wait().await, AttemptOutcome::Superseded);

        assert!(h.sink.kinds_for(LOCAL_A).is_empty());
        assert_eq!(
            h.sink.kinds_for(LOCAL_B),
            vec![LifecycleEventKind::LoadStart, loaded(LOCAL_B, 2, 2), LifecycleEventKind::LoadEnd]
        );
        assert_eq!(lock(&h.surface.images).len(), 1);
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn superseded_attempt_never_emits_terminal_event() {
        let h = harness();
        h.fetcher.respond(REMOTE, Ok(png_bytes(1, 1, [1, 1, 1, 255])));
        h.fetcher.respond(LOCAL_B, Ok(png_bytes(1, 1, [2, 2, 2, 255])));
        let gate = h.fetcher.gate(REMOTE);

        let first = h.pipeline.request_single(ViewId(1), REMOTE, None).expect("request A");
        for _ in 0..100 {
            if h.sink.kinds_for(REMOTE).len() >= 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            h.sink.kinds_for(REMOTE),
            vec![LifecycleEventKind::LoadStart, LifecycleEventKind::Downloading]
        );

        let second = h.pipeline.request_single(ViewId(1), LOCAL_B, None).expect("request B");
        second.wait().await;
        gate.notify_one();
        assert_eq!(first.wait().await, AttemptOutcome::Superseded);

        let remote_kinds = h.sink.kinds_for(REMOTE);
        assert_eq!(remote_kinds.len(), 2);
        assert!(!remote_kinds.iter().any(LifecycleEventKind::is_terminal));
        assert_eq!(h.sink.kinds_for(LOCAL_B).last(), Some(&LifecycleEventKind::LoadEnd));
    }

    #[tokio::test]
    async fn multiple_sources_wait_for_layout_then_pick_closest() {
        let h = harness();
        h.fetcher.respond("uriA", Ok(png_bytes(4, 2, [0, 0, 0, 255])));
        h.fetcher.respond("uriB", Ok(png_bytes(2, 2, [0, 0, 0, 255])));
        let sources = vec![
            ImageSource::with_size("uriA", 200.0, 100.0),
            ImageSource::with_size("uriB", 50.0, 50.0),
        ];

        let pending = h
            .pipeline
            .request_multiple(ViewId(9), sources, TargetSize::UNRESOLVED, None)
            .expect("sources accepted");
        assert!(pending.is_none());
        assert_eq!(h.fetcher.calls(), 0);
        assert!(h.sink.events().is_empty());

        let attempt = h
            .pipeline
            .on_target_size_resolved(ViewId(9), TargetSize::new(60.0, 60.0))
            .expect("selection should start a load");
        assert_eq!(attempt.uri(), "uriB");
        attempt.wait().await;

        assert_eq!(h.sink.kinds_for("uriB").len(), 3);
        assert!(h.sink.kinds_for("uriA").is_empty());

        // 同一来源不会重复加载
        assert!(
            h.pipeline
                .on_target_size_resolved(ViewId(9), TargetSize::new(55.0, 55.0))
                .is_none()
        );

        let switched = h
            .pipeline
            .on_target_size_resolved(ViewId(9), TargetSize::new(200.0, 100.0))
            .expect("larger target selects the other source");
        assert_eq!(switched.uri(), "uriA");
        switched.wait().await;
    }

    #[tokio::test]
    async fn resolved_multiple_request_loads_immediately() {
        let h = harness();
        h.fetcher.respond("small", Ok(png_bytes(1, 1, [0, 0, 0, 255])));

        let attempt = h
            .pipeline
            .request_multiple(
                ViewId(3),
                vec![
                    ImageSource::with_size("small", 10.0, 10.0),
                    ImageSource::with_size("big", 1000.0, 1000.0),
                ],
                TargetSize::new(12.0, 12.0),
                None,
            )
            .expect("sources accepted")
            .expect("resolved target starts a load");

        assert_eq!(attempt.uri(), "small");
        assert!(matches!(attempt.wait().await, AttemptOutcome::Loaded(_)));
    }

    #[tokio::test]
    async fn single_source_set_does_not_wait_for_layout() {
        let h = harness();
        h.fetcher.respond("only", Ok(png_bytes(1, 1, [0, 0, 0, 255])));

        let attempt = h
            .pipeline
            .request_multiple(ViewId(4), vec![ImageSource::new("only")], TargetSize::UNRESOLVED, None)
            .expect("sources accepted");

        assert!(attempt.is_some());
    }

    #[tokio::test]
    async fn empty_sources_are_rejected_without_events() {
        let h = harness();

        let result = h
            .pipeline
            .request_multiple(ViewId(1), Vec::new(), TargetSize::new(1.0, 1.0), None);

        assert!(matches!(result, Err(ImageError::InvalidArgument(_))));
        assert!(matches!(
            h.pipeline.request_single(ViewId(1), "  ", None),
            Err(ImageError::InvalidArgument(_))
        ));
        assert!(h.sink.events().is_empty());
        assert_eq!(h.pipeline.view_count(), 0);
    }

    #[tokio::test]
    async fn target_resolution_without_stored_sources_is_noop() {
        let h = harness();
        assert!(
            h.pipeline
                .on_target_size_resolved(ViewId(42), TargetSize::new(10.0, 10.0))
                .is_none()
        );
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.pipeline.target_size(ViewId(42)), Some(TargetSize::new(10.0, 10.0)));

        h.fetcher.respond(LOCAL_A, Ok(png_bytes(1, 1, [0, 0, 0, 255])));
        h.pipeline
            .request_single(ViewId(42), LOCAL_A, None)
            .expect("request accepted")
            .wait()
            .await;
        assert!(
            h.pipeline
                .on_target_size_resolved(ViewId(42), TargetSize::new(10.0, 10.0))
                .is_none()
        );
    }

    #[tokio::test]
    async fn dropped_view_discards_in_flight_completion() {
        let h = harness();
        h.fetcher.respond(LOCAL_A, Ok(png_bytes(1, 1, [0, 0, 0, 255])));
        let gate = h.fetcher.gate(LOCAL_A);

        let attempt = h.pipeline.request_single(ViewId(5), LOCAL_A, None).expect("request");
        assert!(h.pipeline.drop_view(ViewId(5)));
        assert!(!h.pipeline.drop_view(ViewId(5)));
        gate.notify_one();

        assert_eq!(attempt.wait().await, AttemptOutcome::Superseded);
        assert!(h.sink.events().is_empty());
        assert!(lock(&h.surface.images).is_empty());
        assert_eq!(h.pipeline.phase(ViewId(5)), None);
    }

    #[tokio::test]
    async fn changing_colors_reloads_current_uri() {
        let h = harness();
        h.fetcher.respond(LOCAL_A, Ok(png_bytes(1, 1, [1, 2, 3, 255])));

        h.pipeline
            .request_single(ViewId(6), LOCAL_A, None)
            .expect("request")
            .wait()
            .await;

        let colors = ColorSpec::new(Some(Color::rgba(10, 20, 30, 255)), None);
        let reload = h.pipeline.set_colors(ViewId(6), colors).expect("colors trigger reload");
        reload.wait().await;
        assert!(h.pipeline.set_colors(ViewId(6), colors).is_none());

        let images = lock(&h.surface.images);
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].1.bytes, vec![30, 20, 10, 255]);
        assert_eq!(h.pipeline.colors(ViewId(6)), Some(colors));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn independent_views_load_concurrently() {
        let h = harness();
        let mut attempts = Vec::new();
        for idx in 0..16u64 {
            let uri = format!("assets/{}.png", idx);
            h.fetcher.respond(&uri, Ok(png_bytes(1 + idx as u32, 1, [0, 0, 0, 255])));
            attempts.push(h.pipeline.request_single(ViewId(idx), &uri, None).expect("request"));
        }

        for attempt in attempts {
            assert!(matches!(attempt.wait().await, AttemptOutcome::Loaded(_)));
        }

        let events = h.sink.events();
        for idx in 0..16u64 {
            let per_view: Vec<_> = events.iter().filter(|e| e.view_id == ViewId(idx)).collect();
            assert_eq!(per_view.len(), 3);
            assert_eq!(per_view[0].kind, LifecycleEventKind::LoadStart);
            assert_eq!(per_view[2].kind, LifecycleEventKind::LoadEnd);
        }
        assert_eq!(h.pipeline.view_count(), 16);
    }
}

//! # 生命周期事件
//!
//! ## 设计思路
//!
//! 两种底层通知来源共用同一个事件类型，只在“生产者”上区分：
//! - `LifecycleEmitter::decode_driven`：由解码完成信号驱动（bitmap-opened），
//!   固定为 `LoadStart → Load | LoadFailed → LoadEnd`，不会出现 `Downloading`
//! - `LifecycleEmitter::progress_driven`：由 URI 级进度信号驱动，
//!   `Downloading` 可能出现（至多一次，仅远程来源），也可能直接完成
//!
//! ## 实现思路
//!
//! 发射器只负责顺序约束：`LoadStart` 在最前，`Load` / `LoadFailed` 至多一个，
//! `LoadEnd` 恰好一个且其后不再有事件。事件先缓存在发射器中，
//! 由流水线在确认本次加载仍是最新请求时统一取出派发。

use serde::Serialize;
use tokio::sync::mpsc;

use super::source::{ImageMetadata, PixelBuffer, ViewId};
use super::ImageError;

/// 事件种类。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LifecycleEventKind {
    LoadStart,
    Downloading,
    Load {
        metadata: ImageMetadata,
    },
    #[serde(rename_all = "camelCase")]
    LoadFailed {
        code: &'static str,
        stage: &'static str,
        message: String,
    },
    LoadEnd,
}

impl LifecycleEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoadEnd)
    }
}

/// 下发给宿主的单条事件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub view_id: ViewId,
    pub uri: String,
    #[serde(flatten)]
    pub kind: LifecycleEventKind,
}

impl LifecycleEvent {
    pub fn pixel_size(&self) -> Option<(u32, u32)> {
        match &self.kind {
            LifecycleEventKind::Load { metadata } => Some((metadata.pixel_width, metadata.pixel_height)),
            _ => None,
        }
    }
}

/// 事件接收端。
///
/// 调用发生在该视图状态锁内（保证与取代判断的先后顺序），实现必须不阻塞，
/// 也不能同步回调流水线；需要异步处理时使用 `ChannelEventSink`。
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: LifecycleEvent);
}

/// 渲染表面：接收最终位图。调用约束同 `EventSink`。
pub trait RenderSurfaceSink: Send + Sync {
    fn set_image(&self, view_id: ViewId, bitmap: PixelBuffer);
}

/// 把事件转发到 tokio 无界通道。
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn dispatch(&self, event: LifecycleEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("事件接收端已关闭，丢弃事件");
        }
    }
}

/// 事件流形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStreamShape {
    /// 解码完成驱动
    BitmapOpened,
    /// URI 级进度驱动
    UriProgress,
}

/// 单次加载的事件发射器。
#[derive(Debug)]
pub struct LifecycleEmitter {
    view_id: ViewId,
    uri: String,
    shape: EventStreamShape,
    pending: Vec<LifecycleEventKind>,
    started: bool,
    downloading_sent: bool,
    outcome_sent: bool,
    terminated: bool,
}

impl LifecycleEmitter {
    /// 解码完成驱动的事件流。
    pub fn decode_driven(view_id: ViewId, uri: impl Into<String>) -> Self {
        Self::with_shape(view_id, uri.into(), EventStreamShape::BitmapOpened)
    }

    /// URI 级进度驱动的事件流。
    pub fn progress_driven(view_id: ViewId, uri: impl Into<String>) -> Self {
        Self::with_shape(view_id, uri.into(), EventStreamShape::UriProgress)
    }

    fn with_shape(view_id: ViewId, uri: String, shape: EventStreamShape) -> Self {
        Self {
            view_id,
            uri,
            shape,
            pending: Vec::new(),
            started: false,
            downloading_sent: false,
            outcome_sent: false,
            terminated: false,
        }
    }

    pub fn shape(&self) -> EventStreamShape {
        self.shape
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn load_start(&mut self) {
        self.ensure_started();
    }

    /// 远程下载开始；bitmap-opened 形态下忽略，进度形态下至多一次。
    pub fn downloading(&mut self) {
        if self.shape != EventStreamShape::UriProgress || self.downloading_sent || self.outcome_sent {
            return;
        }
        self.ensure_started();
        if !self.terminated {
            self.downloading_sent = true;
            self.pending.push(LifecycleEventKind::Downloading);
        }
    }

    /// 成功并立即结束：`Load` + `LoadEnd`。
    pub fn succeed(&mut self, metadata: ImageMetadata) {
        if self.outcome_sent || self.terminated {
            return;
        }
        self.ensure_started();
        self.outcome_sent = true;
        self.pending.push(LifecycleEventKind::Load { metadata });
        self.finish();
    }

    /// 失败并立即结束：`LoadFailed` + `LoadEnd`。
    pub fn fail(&mut self, error: &ImageError) {
        if self.outcome_sent || self.terminated {
            return;
        }
        self.ensure_started();
        self.outcome_sent = true;
        self.pending.push(LifecycleEventKind::LoadFailed {
            code: error.code(),
            stage: error.stage(),
            message: error.to_string(),
        });
        self.finish();
    }

    /// 终止事件，只会产生一次。
    pub fn finish(&mut self) {
        if self.terminated {
            return;
        }
        self.ensure_started();
        self.terminated = true;
        self.pending.push(LifecycleEventKind::LoadEnd);
    }

    /// 取出尚未派发的事件。
    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        self.pending
            .drain(..)
            .map(|kind| LifecycleEvent {
                view_id: self.view_id,
                uri: self.uri.clone(),
                kind,
            })
            .collect()
    }

    /// 丢弃尚未派发的事件（本次加载已被取代）。
    pub fn discard(&mut self) {
        self.pending.clear();
        self.terminated = true;
    }

    fn ensure_started(&mut self) {
        if !self.started && !self.terminated {
            self.started = true;
            self.pending.push(LifecycleEventKind::LoadStart);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ImageMetadata {
        ImageMetadata {
            uri: "https://example.com/a.png".to_string(),
            pixel_width: 4,
            pixel_height: 2,
        }
    }

    fn kinds(events: &[LifecycleEvent]) -> Vec<LifecycleEventKind> {
        events.iter().map(|e| e.kind.clone()).collect()
    }

    #[test]
    fn decode_driven_stream_never_reports_downloading() {
        let mut emitter = LifecycleEmitter::decode_driven(ViewId(1), "a.png");
        emitter.load_start();
        emitter.downloading();
        emitter.succeed(metadata());

        assert_eq!(
            kinds(&emitter.drain()),
            vec![
                LifecycleEventKind::LoadStart,
                LifecycleEventKind::Load { metadata: metadata() },
                LifecycleEventKind::LoadEnd,
            ]
        );
    }

    #[test]
    fn progress_driven_stream_reports_downloading_once() {
        let mut emitter = LifecycleEmitter::progress_driven(ViewId(1), "a.png");
        emitter.load_start();
        emitter.downloading();
        let first = emitter.drain();
        emitter.downloading();
        emitter.succeed(metadata());
        let rest = emitter.drain();

        assert_eq!(
            kinds(&first),
            vec![LifecycleEventKind::LoadStart, LifecycleEventKind::Downloading]
        );
        assert_eq!(
            kinds(&rest),
            vec![LifecycleEventKind::Load { metadata: metadata() }, LifecycleEventKind::LoadEnd]
        );
    }

    #[test]
    fn nothing_follows_the_terminal_event() {
        let mut emitter = LifecycleEmitter::progress_driven(ViewId(7), "a.png");
        emitter.fail(&ImageError::DecodeFailed("bad".to_string()));
        emitter.succeed(metadata());
        emitter.downloading();
        emitter.finish();

        let events = emitter.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, LifecycleEventKind::LoadStart);
        assert!(matches!(
            events[1].kind,
            LifecycleEventKind::LoadFailed { code: "E_DECODE", stage: "decode", .. }
        ));
        assert!(events[2].kind.is_terminal());
        assert!(emitter.drain().is_empty());
    }

    #[test]
    fn discarded_emitter_stays_silent() {
        let mut emitter = LifecycleEmitter::decode_driven(ViewId(3), "a.png");
        emitter.load_start();
        emitter.discard();
        emitter.succeed(metadata());

        assert!(emitter.drain().is_empty());
    }

    #[test]
    fn events_serialize_as_tagged_camel_case_json() {
        let event = LifecycleEvent {
            view_id: ViewId(5),
            uri: "a.png".to_string(),
            kind: LifecycleEventKind::Load { metadata: metadata() },
        };

        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["viewId"], 5);
        assert_eq!(json["kind"], "load");
        assert_eq!(json["metadata"]["pixelWidth"], 4);
        assert_eq!(event.pixel_size(), Some((4, 2)));
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut receiver) = ChannelEventSink::new();
        sink.dispatch(LifecycleEvent {
            view_id: ViewId(1),
            uri: "a.png".to_string(),
            kind: LifecycleEventKind::LoadEnd,
        });

        let event = receiver.recv().await.expect("event should arrive");
        assert!(event.kind.is_terminal());
    }
}

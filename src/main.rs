//! # 自适应图片加载 — 命令行入口
//!
//! 本文件仅负责参数解析与收发端装配：生命周期事件以 JSON Lines 写到 stdout，
//! 日志写到 stderr。业务逻辑详见 `lib.rs` 架构文档。

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use adaptive_image_loader::error::AppError;
use adaptive_image_loader::image_loader::{
    AttemptOutcome, Color, ColorSpec, EventSink, ImageLoaderConfig, ImageSource, LifecycleEvent, LoadPipeline,
    PixelBuffer, RenderSurfaceSink, SourceProp, TargetSize, ViewId,
};
use clap::Parser;

const DEMO_VIEW: ViewId = ViewId(1);

/// 按目标尺寸从候选来源中挑选并加载图片
#[derive(Parser, Debug)]
#[command(name = "adaptive-image-loader")]
#[command(about = "按目标尺寸从候选来源中挑选并加载图片，事件以 JSON Lines 输出")]
#[command(version)]
struct Args {
    /// JSON 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 目标尺寸，例如 120x80
    #[arg(long, value_parser = parse_size)]
    target: Option<TargetSize>,

    /// 着色颜色：#RRGGBB、#RRGGBBAA 或 ARGB 数值
    #[arg(long, value_parser = parse_color)]
    tint: Option<Color>,

    /// 背景颜色：#RRGGBB、#RRGGBBAA 或 ARGB 数值
    #[arg(long, value_parser = parse_color)]
    background: Option<Color>,

    /// 候选来源
    #[arg(required = true, value_name = "URI[@WxH]")]
    sources: Vec<String>,
}

/// 把事件逐行写到 stdout。
struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn dispatch(&self, event: LifecycleEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                log::warn!("事件序列化失败：{}", err);
                return;
            }
        };

        let mut stdout = std::io::stdout().lock();
        if let Err(err) = writeln!(stdout, "{}", line) {
            log::warn!("写出事件失败：{}", err);
        }
    }
}

/// 只记录收到的位图。
struct LoggingSurface;

impl RenderSurfaceSink for LoggingSurface {
    fn set_image(&self, view_id: ViewId, bitmap: PixelBuffer) {
        log::info!(
            "🖼️ 渲染表面收到位图 - {} 尺寸: {}x{}（{} 字节）",
            view_id,
            bitmap.width,
            bitmap.height,
            bitmap.bytes.len()
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(args).await {
        Ok(AttemptOutcome::Loaded(metadata)) => {
            log::info!("✅ 加载成功 - {}x{}", metadata.pixel_width, metadata.pixel_height);
            ExitCode::SUCCESS
        }
        Ok(AttemptOutcome::Failed(err)) => {
            log::error!("❌ 加载失败：{}", err);
            ExitCode::FAILURE
        }
        Ok(AttemptOutcome::Superseded) => {
            log::error!("❌ 加载被取代，没有结果");
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("❌ {}", err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<AttemptOutcome, AppError> {
    let config = match &args.config {
        Some(path) => {
            log::info!("读取配置文件: {}", path.display());
            ImageLoaderConfig::from_json_str(&tokio::fs::read_to_string(path).await?)?
        }
        None => ImageLoaderConfig::default(),
    };

    let colors = ColorSpec::new(args.tint, args.background);
    let sources: Vec<SourceProp> = args.sources.iter().map(|arg| parse_source_arg(arg)).collect();
    let pipeline = LoadPipeline::new(config, Arc::new(JsonLinesSink), Arc::new(LoggingSurface))?;

    let attempt = if sources.len() == 1 {
        if let Some(target) = args.target {
            pipeline.on_target_size_resolved(DEMO_VIEW, target);
        }
        pipeline.request_single(DEMO_VIEW, &sources[0].uri, Some(colors))?
    } else {
        let target = args
            .target
            .ok_or_else(|| AppError::Usage("多个来源时必须指定 --target".to_string()))?;
        let sources = sources.into_iter().map(ImageSource::from).collect();
        pipeline
            .request_multiple(DEMO_VIEW, sources, target, Some(colors))?
            .ok_or_else(|| AppError::Usage("目标尺寸无效，无法选择来源".to_string()))?
    };

    log::info!("🚀 开始加载 - {} generation {}", DEMO_VIEW, attempt.generation());
    Ok(attempt.wait().await)
}

/// `URI@WxH` 中的尺寸后缀可选；后缀不是合法尺寸时整体视为 URI。
fn parse_source_arg(arg: &str) -> SourceProp {
    match arg.rsplit_once('@') {
        Some((uri, size)) if !uri.is_empty() => match parse_size(size) {
            Ok(size) => SourceProp::sized(uri, size.width, size.height),
            Err(_) => SourceProp::new(arg),
        },
        _ => SourceProp::new(arg),
    }
}

fn parse_size(text: &str) -> Result<TargetSize, String> {
    let (width, height) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("尺寸格式应为 宽x高：{}", text))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| format!("尺寸不是合法数字：{}", text))
    };

    Ok(TargetSize::new(parse(width)?, parse(height)?))
}

fn parse_color(text: &str) -> Result<Color, String> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16)
            .map(Color::from_argb)
            .map_err(|e| format!("ARGB 数值无效：{}（{}）", text, e));
    }
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed
            .parse::<u32>()
            .map(Color::from_argb)
            .map_err(|e| format!("ARGB 数值无效：{}（{}）", text, e));
    }

    Color::parse_hex(trimmed).map_err(String::from)
}

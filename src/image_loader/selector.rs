//! # 来源选择
//!
//! 在候选来源中选出声明面积最接近目标面积的一项。
//! 只做一次稳定的最小值扫描，面积差相同时保留最先出现的来源。

use super::source::{ImageSource, ImageSourceSet, TargetSize};
use super::ImageError;

/// 为目标尺寸挑选最合适的来源。
///
/// 调用方必须在 `target` 已解析后才调用；只有一个来源时直接返回，不计算面积。
/// 未声明面积的来源按面积 0 参与比较。
///
/// # 示例
/// ```rust
/// use adaptive_image_loader::image_loader::{select, ImageSource, ImageSourceSet, TargetSize};
///
/// let sources = ImageSourceSet::new(vec![
///     ImageSource::with_size("a.png", 200.0, 100.0),
///     ImageSource::with_size("b.png", 50.0, 50.0),
/// ])?;
/// let chosen = select(sources.as_slice(), TargetSize::new(60.0, 60.0))?;
/// assert_eq!(chosen.uri, "b.png");
/// # Ok::<(), adaptive_image_loader::image_loader::ImageError>(())
/// ```
pub fn select(sources: &[ImageSource], target: TargetSize) -> Result<&ImageSource, ImageError> {
    let (first, rest) = sources
        .split_first()
        .ok_or_else(|| ImageError::InvalidArgument("来源列表不能为空".to_string()))?;

    if rest.is_empty() {
        return Ok(first);
    }

    let target_area = target.area();
    let distance = |source: &ImageSource| (source.declared_area.unwrap_or(0.0) - target_area).abs();

    let mut best = first;
    let mut best_distance = distance(first);
    for candidate in rest {
        let candidate_distance = distance(candidate);
        // 严格小于：相等时保留更早的来源
        if candidate_distance < best_distance {
            best = candidate;
            best_distance = candidate_distance;
        }
    }

    Ok(best)
}

/// `ImageSourceSet` 版本，集合非空已由构造保证。
pub fn select_from_set(set: &ImageSourceSet, target: TargetSize) -> Result<&ImageSource, ImageError> {
    select(set.as_slice(), target)
}

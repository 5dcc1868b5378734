//! # 像素合成
//!
//! ## 设计思路
//!
//! 对解码得到的 BGRA8 缓冲逐像素处理，输入只读、输出新缓冲：
//! 1. `tint`：alpha 非 0 的像素直接替换 B/G/R（剪影着色，不做混合），alpha 保留
//! 2. `background`：把（可能已着色的）像素按 “over” 公式叠加到背景色上
//!
//! ## 注意
//!
//! 输出 alpha 为 `front + back * (1 - front / 255)`，其中 front 已是 0~1 的比例（会被再除一次 255），
//! 与通道公式的量纲不同。输出必须与既有渲染结果逐字节一致，不要“修正”。

use super::source::{Color, PixelBuffer};
use super::ImageError;

/// 对像素缓冲应用着色 / 背景合成，返回新的缓冲。
///
/// 两种颜色都未设置时返回与输入逐字节一致的副本。
///
/// # 示例
/// ```rust
/// use adaptive_image_loader::image_loader::{composite, Color, PixelBuffer};
///
/// let input = PixelBuffer::from_raw(1, 1, vec![10, 20, 30, 255])?;
/// let output = composite(&input, None, Some(Color::rgba(0, 0, 0, 255)))?;
/// assert_eq!(output.bytes, vec![10, 20, 30, 255]);
/// # Ok::<(), adaptive_image_loader::image_loader::ImageError>(())
/// ```
pub fn composite(
    buffer: &PixelBuffer,
    tint: Option<Color>,
    background: Option<Color>,
) -> Result<PixelBuffer, ImageError> {
    buffer.validate()?;

    let mut bytes = buffer.bytes.clone();
    for pixel in bytes.chunks_exact_mut(4) {
        if let Some(tint) = tint {
            apply_tint(pixel, tint);
        }
        if let Some(background) = background {
            blend_over(pixel, background);
        }
    }

    Ok(PixelBuffer {
        width: buffer.width,
        height: buffer.height,
        bytes,
    })
}

/// 像素存储顺序为 B, G, R, A。
fn apply_tint(pixel: &mut [u8], tint: Color) {
    if pixel[3] == 0 {
        return;
    }
    pixel[0] = tint.b;
    pixel[1] = tint.g;
    pixel[2] = tint.r;
}

fn blend_over(pixel: &mut [u8], background: Color) {
    let front_alpha = pixel[3] as f32 / 255.0;
    let back_alpha = background.a as f32 / 255.0;
    let back_weight = back_alpha * (1.0 - front_alpha);
    let coverage = front_alpha + back_weight;

    let channel = |front: u8, back: u8| -> u8 {
        if coverage <= 0.0 {
            return 0;
        }
        ((front as f32 * front_alpha + back as f32 * back_weight) / coverage) as u8
    };

    pixel[0] = channel(pixel[0], background.b);
    pixel[1] = channel(pixel[1], background.g);
    pixel[2] = channel(pixel[2], background.r);

    let out_alpha = front_alpha + back_alpha * (1.0 - front_alpha / 255.0);
    // `as u8` 对浮点数截断并饱和到 0~255
    pixel[3] = (out_alpha * 255.0) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer(width: u32, height: u32, bytes: Vec<u8>) -> PixelBuffer {
        PixelBuffer::from_raw(width, height, bytes).expect("valid test buffer")
    }

    #[test]
    fn opaque_pixel_over_opaque_background_is_unchanged() {
        let input = buffer(1, 1, vec![10, 20, 30, 255]);
        let output = composite(&input, None, Some(Color::rgba(0, 0, 0, 255))).expect("composite");

        assert_eq!(output.bytes, vec![10, 20, 30, 255]);
    }

    #[test]
    fn transparent_pixel_takes_background_color() {
        let input = buffer(1, 1, vec![200, 200, 200, 0]);
        let output = composite(&input, None, Some(Color::rgba(40, 50, 60, 255))).expect("composite");

        // B, G, R 顺序
        assert_eq!(output.bytes, vec![60, 50, 40, 255]);
    }

    #[test]
    fn half_transparent_pixel_blends_with_background() {
        let input = buffer(1, 1, vec![255, 0, 0, 128]);
        let output = composite(&input, None, Some(Color::rgba(0, 0, 255, 255))).expect("composite");

        let fa = 128.0_f32 / 255.0;
        let back = 1.0 - fa;
        let coverage = fa + back;
        let expected_b = ((255.0 * fa + 255.0 * back) / coverage) as u8;
        let expected_g = 0u8;
        let expected_r = ((0.0 * fa + 0.0 * back) / coverage) as u8;
        let expected_a = ((fa + (1.0 - fa / 255.0)) * 255.0) as u8;

        assert_eq!(output.bytes, vec![expected_b, expected_g, expected_r, expected_a]);
        assert_eq!(expected_a, 255);
    }

    #[test]
    fn output_alpha_keeps_the_double_division() {
        // 背景半透明、前景透明：0 + 0.5 * (1 - 0) = 0.5
        let input = buffer(1, 1, vec![0, 0, 0, 0]);
        let output = composite(&input, None, Some(Color::rgba(0, 0, 0, 128))).expect("composite");
        assert_eq!(output.bytes[3], ((128.0_f32 / 255.0) * 255.0) as u8);

        // 前景半透明、背景半透明：front + back * (1 - front / 255)，明显大于标准 over
        let input = buffer(1, 1, vec![0, 0, 0, 128]);
        let output = composite(&input, None, Some(Color::rgba(0, 0, 0, 128))).expect("composite");
        let fa = 128.0_f32 / 255.0;
        let expected = ((fa + fa * (1.0 - fa / 255.0)) * 255.0) as u8;
        assert_eq!(output.bytes[3], expected);
        assert!(expected > 200);
    }

    #[test]
    fn fully_transparent_inputs_produce_zero_channels() {
        let input = buffer(1, 1, vec![9, 9, 9, 0]);
        let output = composite(&input, None, Some(Color::rgba(1, 2, 3, 0))).expect("composite");

        assert_eq!(output.bytes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn tint_replaces_color_of_visible_pixels_only() {
        let input = buffer(2, 1, vec![1, 2, 3, 0, 4, 5, 6, 77]);
        let output = composite(&input, Some(Color::rgba(10, 20, 30, 5)), None).expect("composite");

        assert_eq!(output.bytes, vec![1, 2, 3, 0, 30, 20, 10, 77]);
    }

    #[test]
    fn tint_then_background_composes_both() {
        let input = buffer(1, 1, vec![1, 2, 3, 255]);
        let output = composite(
            &input,
            Some(Color::rgba(100, 110, 120, 255)),
            Some(Color::rgba(0, 0, 0, 255)),
        )
        .expect("composite");

        assert_eq!(output.bytes, vec![120, 110, 100, 255]);
    }

    #[test]
    fn malformed_buffers_are_invalid_arguments() {
        let short = PixelBuffer {
            width: 2,
            height: 2,
            bytes: vec![0; 15],
        };
        assert!(matches!(
            composite(&short, None, None),
            Err(ImageError::InvalidArgument(_))
        ));

        let empty = PixelBuffer {
            width: 0,
            height: 0,
            bytes: Vec::new(),
        };
        assert!(matches!(
            composite(&empty, Some(Color::rgba(0, 0, 0, 255)), None),
            Err(ImageError::InvalidArgument(_))
        ));
    }

    fn arb_buffer() -> impl Strategy<Value = PixelBuffer> {
        (1u32..8, 1u32..8).prop_flat_map(|(w, h)| {
            prop::collection::vec(any::<u8>(), (w * h * 4) as usize).prop_map(move |bytes| PixelBuffer {
                width: w,
                height: h,
                bytes,
            })
        })
    }

    proptest! {
        #[test]
        fn no_colors_is_identity(input in arb_buffer()) {
            let output = composite(&input, None, None).expect("composite");
            prop_assert_eq!(output, input);
        }

        #[test]
        fn tint_preserves_alpha(input in arb_buffer(), r: u8, g: u8, b: u8, a: u8) {
            let output = composite(&input, Some(Color::rgba(r, g, b, a)), None).expect("composite");

            prop_assert_eq!(output.bytes.len(), input.bytes.len());
            for (src, dst) in input.bytes.chunks_exact(4).zip(output.bytes.chunks_exact(4)) {
                prop_assert_eq!(src[3], dst[3]);
                if src[3] == 0 {
                    prop_assert_eq!(&src[..3], &dst[..3]);
                } else {
                    prop_assert_eq!(&dst[..3], &[b, g, r][..]);
                }
            }
        }
    }
}

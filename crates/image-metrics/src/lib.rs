//! Image-level statistics reported next to a caption.
//!
//! All values are normalised to `[0, 1]` except the dominant color, which is an
//! 8-bit RGB triple. Computation is pure and deterministic for a given pixel
//! buffer, and CPU bound, so async callers should run it on a blocking thread.

use image::DynamicImage;
use serde::Serialize;
use tracing::debug;

/// Canny hysteresis thresholds used for edge density.
const CANNY_LOW_THRESHOLD: f32 = 50.0;
const CANNY_HIGH_THRESHOLD: f32 = 100.0;

/// Bits kept per channel when bucketing colors for the dominant color.
const DOMINANT_COLOR_BITS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetrics {
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub dominant_color: Rgb,
    pub edge_density: f64,
    /// Reserved, always 0.0. Text detection is not performed.
    pub text_ratio: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    /// When false `edge_density` is reported as 0.0 and the detector is skipped
    pub edge_detection: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            edge_detection: true,
        }
    }
}

/// Per-channel mean and population standard deviation, in 0..=255 units.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelStats {
    mean: [f64; 3],
    std_dev: [f64; 3],
}

pub fn extract(image: &DynamicImage) -> ImageMetrics {
    extract_with(image, MetricsConfig::default())
}

pub fn extract_with(image: &DynamicImage, config: MetricsConfig) -> ImageMetrics {
    let rgb = image.to_rgb8();
    let stats = channel_stats(&rgb);

    let brightness = stats.mean.iter().sum::<f64>() / 3.0 / 255.0;
    let contrast = stats.std_dev.iter().sum::<f64>() / 3.0 / 255.0;
    let saturation = saturation(stats.mean[0], stats.mean[1], stats.mean[2]);
    let dominant_color = dominant_color(&rgb);
    let edge_density = if config.edge_detection {
        edge_density(image)
    } else {
        0.0
    };

    debug!(
        "metrics for {}x{}: brightness={:.3} contrast={:.3} saturation={:.3} edges={:.3}",
        rgb.width(),
        rgb.height(),
        brightness,
        contrast,
        saturation,
        edge_density
    );

    ImageMetrics {
        brightness: brightness.clamp(0.0, 1.0),
        contrast: contrast.clamp(0.0, 1.0),
        saturation,
        dominant_color,
        edge_density,
        text_ratio: 0.0,
    }
}

fn channel_stats(rgb: &image::RgbImage) -> ChannelStats {
    let count = rgb.width() as u64 * rgb.height() as u64;
    if count == 0 {
        return ChannelStats::default();
    }

    let mut sum = [0u64; 3];
    let mut sum_sq = [0u64; 3];
    for pixel in rgb.pixels() {
        for c in 0..3 {
            let v = pixel[c] as u64;
            sum[c] += v;
            sum_sq[c] += v * v;
        }
    }

    let n = count as f64;
    let mut stats = ChannelStats::default();
    for c in 0..3 {
        let mean = sum[c] as f64 / n;
        let variance = (sum_sq[c] as f64 / n - mean * mean).max(0.0);
        stats.mean[c] = mean;
        stats.std_dev[c] = variance.sqrt();
    }
    stats
}

/// HSL saturation of a single color given in 0..=255 units.
///
/// The service applies it to the mean R, G and B of the image, not per pixel.
pub fn saturation(r: f64, g: f64, b: f64) -> f64 {
    let (r, g, b) = (r / 255.0, g / 255.0, b / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if l == 0.0 || max == min {
        return 0.0;
    }

    let denominator = 1.0 - (2.0 * l - 1.0).abs();
    if denominator <= 0.0 {
        return 0.0;
    }
    ((max - min) / denominator).clamp(0.0, 1.0)
}

/// Most populated bucket of a 16x16x16 color histogram, reported as the mean
/// color of the pixels that fell into it.
fn dominant_color(rgb: &image::RgbImage) -> Rgb {
    let shift = 8 - DOMINANT_COLOR_BITS;
    let levels = 1usize << DOMINANT_COLOR_BITS;
    // (count, r_sum, g_sum, b_sum)
    let mut buckets = vec![(0u64, 0u64, 0u64, 0u64); levels * levels * levels];

    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        let index = ((r >> shift) as usize * levels + (g >> shift) as usize) * levels
            + (b >> shift) as usize;
        let bucket = &mut buckets[index];
        bucket.0 += 1;
        bucket.1 += r as u64;
        bucket.2 += g as u64;
        bucket.3 += b as u64;
    }

    // first maximum wins, so ties resolve towards darker buckets
    let best = buckets
        .iter()
        .fold(None::<&(u64, u64, u64, u64)>, |best, bucket| match best {
            Some(b) if b.0 >= bucket.0 => Some(b),
            _ if bucket.0 == 0 => best,
            _ => Some(bucket),
        });

    match best {
        Some(&(count, r, g, b)) => Rgb {
            r: (r / count) as u8,
            g: (g / count) as u8,
            b: (b / count) as u8,
        },
        None => Rgb { r: 0, g: 0, b: 0 },
    }
}

/// Share of edge intensity found by Canny on the grayscale image.
fn edge_density(image: &DynamicImage) -> f64 {
    let gray = image.to_luma8();
    let count = gray.width() as u64 * gray.height() as u64;
    if count == 0 {
        return 0.0;
    }

    let edges = imageproc::edges::canny(&gray, CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD);
    let total: u64 = edges.pixels().map(|p| p[0] as u64).sum();

    (total as f64 / (count as f64 * 255.0)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb as Pixel, RgbImage};

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Pixel(color)))
    }

    fn split_black_white(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Pixel([0, 0, 0])
            } else {
                Pixel([255, 255, 255])
            }
        }))
    }

    #[test]
    fn gray_has_no_saturation() {
        for v in [0.0, 1.0, 64.0, 128.0, 254.0, 255.0] {
            assert_eq!(saturation(v, v, v), 0.0, "gray level {v}");
        }
    }

    #[test]
    fn pure_colors_are_fully_saturated() {
        assert!((saturation(255.0, 0.0, 0.0) - 1.0).abs() < 1e-9);
        assert!((saturation(0.0, 0.0, 255.0) - 1.0).abs() < 1e-9);

        let muted = saturation(150.0, 100.0, 100.0);
        assert!(muted > 0.0 && muted < 1.0);
    }

    #[test]
    fn solid_red_metrics() {
        let metrics = extract(&solid(10, 10, [255, 0, 0]));

        assert!((metrics.brightness - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.contrast, 0.0);
        assert!((metrics.saturation - 1.0).abs() < 1e-9);
        assert_eq!(metrics.dominant_color, Rgb { r: 255, g: 0, b: 0 });
        assert_eq!(metrics.edge_density, 0.0);
        assert_eq!(metrics.text_ratio, 0.0);
    }

    #[test]
    fn brightness_and_contrast_stay_in_range() {
        let images = [
            solid(8, 8, [0, 0, 0]),
            solid(8, 8, [255, 255, 255]),
            split_black_white(16, 16),
            DynamicImage::ImageRgb8(RgbImage::from_fn(17, 5, |x, y| {
                Pixel([(x * 15) as u8, (y * 50) as u8, ((x + y) * 7) as u8])
            })),
        ];

        for image in &images {
            let metrics = extract(image);
            assert!((0.0..=1.0).contains(&metrics.brightness));
            assert!((0.0..=1.0).contains(&metrics.contrast));
            assert!((0.0..=1.0).contains(&metrics.saturation));
            assert!((0.0..=1.0).contains(&metrics.edge_density));
        }

        let half = extract(&split_black_white(16, 16));
        assert!((half.brightness - 0.5).abs() < 1e-9);
        assert!((half.contrast - 0.5).abs() < 1e-9);
    }

    #[test]
    fn edge_density_detects_boundary() {
        assert_eq!(extract(&solid(32, 32, [90, 140, 200])).edge_density, 0.0);
        assert!(extract(&split_black_white(32, 32)).edge_density > 0.0);
    }

    #[test]
    fn edge_detection_can_be_disabled() {
        let metrics = extract_with(
            &split_black_white(32, 32),
            MetricsConfig {
                edge_detection: false,
            },
        );
        assert_eq!(metrics.edge_density, 0.0);
    }

    #[test]
    fn dominant_color_prefers_majority() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(10, 10, |x, _| {
            if x < 7 {
                Pixel([10, 200, 30])
            } else {
                Pixel([250, 250, 250])
            }
        }));
        assert_eq!(extract(&image).dominant_color, Rgb { r: 10, g: 200, b: 30 });
    }

    #[test]
    fn empty_image_yields_zeros() {
        let metrics = extract(&DynamicImage::new_rgb8(0, 0));
        assert_eq!(metrics.brightness, 0.0);
        assert_eq!(metrics.dominant_color, Rgb { r: 0, g: 0, b: 0 });
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let value = serde_json::to_value(extract(&solid(2, 2, [1, 2, 3]))).expect("json");
        assert!(value.get("dominantColor").is_some());
        assert!(value.get("edgeDensity").is_some());
        assert_eq!(value["textRatio"], 0.0);
    }
}

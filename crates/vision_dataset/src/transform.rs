//! Image transform pipeline: crops, resizes, flips, then tensor conversion and normalization.

use image::imageops::FilterType;
use image::RgbImage;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-channel ImageNet statistics.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const DEFAULT_SCALE: (f32, f32) = (0.08, 1.0);
const DEFAULT_RATIO: (f32, f32) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos,
}

impl Interpolation {
    pub fn filter(&self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::Bicubic => FilterType::CatmullRom,
            Interpolation::Lanczos => FilterType::Lanczos3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Bilinear => "bilinear",
            Interpolation::Bicubic => "bicubic",
            Interpolation::Lanczos => "lanczos",
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interpolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Interpolation::Nearest),
            "bilinear" => Ok(Interpolation::Bilinear),
            "bicubic" => Ok(Interpolation::Bicubic),
            "lanczos" => Ok(Interpolation::Lanczos),
            other => Err(format!(
                "unknown interpolation '{other}' (expected nearest, bilinear, bicubic or lanczos)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Crop a random area/aspect window and resize it to `size x size`.
    RandomResizedCrop {
        size: u32,
        scale: (f32, f32),
        ratio: (f32, f32),
        interpolation: Interpolation,
    },
    RandomHorizontalFlip { prob: f32 },
    /// Resize so the shorter side equals `size`, keeping the aspect ratio.
    Resize {
        size: u32,
        interpolation: Interpolation,
    },
    /// Take the central `size x size` window, zero-padding smaller images.
    CenterCrop { size: u32 },
}

impl Transform {
    pub fn random_resized_crop(size: u32, interpolation: Interpolation) -> Self {
        Transform::RandomResizedCrop {
            size,
            scale: DEFAULT_SCALE,
            ratio: DEFAULT_RATIO,
            interpolation,
        }
    }

    pub fn apply(&self, img: RgbImage, rng: &mut dyn rand::RngCore) -> RgbImage {
        match *self {
            Transform::RandomResizedCrop {
                size,
                scale,
                ratio,
                interpolation,
            } => {
                let (x, y, w, h) = random_resized_crop_params(img.width(), img.height(), scale, ratio, rng);
                let cropped = image::imageops::crop_imm(&img, x, y, w, h).to_image();
                image::imageops::resize(&cropped, size, size, interpolation.filter())
            }
            Transform::RandomHorizontalFlip { prob } => {
                let mut img = img;
                maybe_hflip(&mut img, prob, rng);
                img
            }
            Transform::Resize {
                size,
                interpolation,
            } => {
                let (w, h) = resized_dims(img.width(), img.height(), size);
                if (w, h) == img.dimensions() {
                    img
                } else {
                    image::imageops::resize(&img, w, h, interpolation.filter())
                }
            }
            Transform::CenterCrop { size } => center_crop(&img, size),
        }
    }

    fn describe(&self) -> String {
        match self {
            Transform::RandomResizedCrop {
                size,
                scale,
                ratio,
                interpolation,
            } => format!(
                "random_resized_crop(size={size}, scale=[{:.2},{:.2}], ratio=[{:.3},{:.3}], {interpolation})",
                scale.0, scale.1, ratio.0, ratio.1
            ),
            Transform::RandomHorizontalFlip { prob } => format!("hflip(p={prob:.2})"),
            Transform::Resize {
                size,
                interpolation,
            } => format!("resize({size}, {interpolation})"),
            Transform::CenterCrop { size } => format!("center_crop({size})"),
        }
    }
}

/// Image steps followed by u8 → f32 conversion and per-channel normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    pub steps: Vec<Transform>,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Seed for per-sample augmentation randomness; `None` uses the thread RNG.
    pub seed: Option<u64>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            seed: None,
        }
    }
}

impl TransformPipeline {
    /// Training preset: random-resized-crop, optional horizontal flip, normalize.
    pub fn train(crop_size: u32, interpolation: Interpolation, hflip_prob: f32) -> Self {
        let mut steps = vec![Transform::random_resized_crop(crop_size, interpolation)];
        if hflip_prob > 0.0 {
            steps.push(Transform::RandomHorizontalFlip { prob: hflip_prob });
        }
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Evaluation preset: resize shorter side, center crop, normalize.
    pub fn eval(resize_size: u32, crop_size: u32, interpolation: Interpolation) -> Self {
        Self {
            steps: vec![
                Transform::Resize {
                    size: resize_size,
                    interpolation,
                },
                Transform::CenterCrop { size: crop_size },
            ],
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    pub fn then(mut self, step: Transform) -> Self {
        self.steps.push(step);
        self
    }

    pub fn describe(&self) -> String {
        let steps: Vec<String> = self.steps.iter().map(Transform::describe).collect();
        format!(
            "{} -> to_tensor -> normalize(mean={:?}, std={:?}) seed={}",
            if steps.is_empty() {
                "identity".to_string()
            } else {
                steps.join(" -> ")
            },
            self.mean,
            self.std,
            self.seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    /// Run the image steps and return the normalized CHW buffer with its final size.
    pub fn apply(&self, img: RgbImage, rng: &mut dyn rand::RngCore) -> (Vec<f32>, u32, u32) {
        let img = self
            .steps
            .iter()
            .fold(img, |img, step| step.apply(img, rng));
        let (width, height) = img.dimensions();
        (self.to_normalized_chw(&img), width, height)
    }

    fn to_normalized_chw(&self, img: &RgbImage) -> Vec<f32> {
        let plane = (img.width() * img.height()) as usize;
        let mut chw = vec![0.0f32; plane * 3];
        for (x, y, pixel) in img.enumerate_pixels() {
            let base = (y * img.width() + x) as usize;
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                chw[c * plane + base] = (v - self.mean[c]) / self.std[c];
            }
        }
        chw
    }
}

/// Pick the crop window `(x, y, w, h)` for a random-resized-crop.
pub fn random_resized_crop_params(
    width: u32,
    height: u32,
    scale: (f32, f32),
    ratio: (f32, f32),
    rng: &mut dyn rand::RngCore,
) -> (u32, u32, u32, u32) {
    let area = (width * height) as f32;
    let log_ratio = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.random_range(scale.0..=scale.1);
        let aspect = rng.random_range(log_ratio.0..=log_ratio.1).exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if 0 < w && w <= width && 0 < h && h <= height {
            let y = rng.random_range(0..=height - h);
            let x = rng.random_range(0..=width - w);
            return (x, y, w, h);
        }
    }

    // Fallback: central crop clamped to the allowed aspect range.
    let in_ratio = width as f32 / height as f32;
    let (w, h) = if in_ratio < ratio.0.min(ratio.1) {
        let w = width;
        (w, ((w as f32 / ratio.0.min(ratio.1)).round() as u32).clamp(1, height))
    } else if in_ratio > ratio.0.max(ratio.1) {
        let h = height;
        (((h as f32 * ratio.0.max(ratio.1)).round() as u32).clamp(1, width), h)
    } else {
        (width, height)
    };
    ((width - w) / 2, (height - h) / 2, w, h)
}

/// Output size when the shorter side is resized to `size`.
pub fn resized_dims(width: u32, height: u32, size: u32) -> (u32, u32) {
    if width <= height {
        let long = (size as u64 * height as u64 / width.max(1) as u64) as u32;
        (size, long)
    } else {
        let long = (size as u64 * width as u64 / height.max(1) as u64) as u32;
        (long, size)
    }
}

pub fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let padded;
    let src = if size > w || size > h {
        let pad_w = size.max(w);
        let pad_h = size.max(h);
        let mut canvas = RgbImage::new(pad_w, pad_h);
        let left = (pad_w - w) / 2;
        let top = (pad_h - h) / 2;
        image::imageops::replace(&mut canvas, img, left.into(), top.into());
        padded = canvas;
        &padded
    } else {
        img
    };
    let (w, h) = src.dimensions();
    let top = ((h - size) as f64 / 2.0).round_ties_even() as u32;
    let left = ((w - size) as f64 / 2.0).round_ties_even() as u32;
    image::imageops::crop_imm(src, left, top, size, size).to_image()
}

pub(crate) fn maybe_hflip(img: &mut RgbImage, prob: f32, rng: &mut dyn rand::RngCore) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        image::imageops::flip_horizontal_in_place(img);
    }
}

#[cfg(test)]
mod transform_tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn resize_keeps_aspect_of_shorter_side() {
        assert_eq!(resized_dims(500, 375, 256), (341, 256));
        assert_eq!(resized_dims(300, 600, 256), (256, 512));
        assert_eq!(resized_dims(256, 256, 256), (256, 256));
    }

    #[test]
    fn center_crop_pads_small_images() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([200, 10, 10]));
        let out = center_crop(&img, 4);
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(1, 1)[0], 200);
    }

    #[test]
    fn center_crop_takes_middle_window() {
        let img = RgbImage::from_fn(5, 5, |x, y| image::Rgb([(x * 10) as u8, (y * 10) as u8, 0]));
        let out = center_crop(&img, 3);
        assert_eq!(out.get_pixel(0, 0)[0], 10);
        assert_eq!(out.get_pixel(0, 0)[1], 10);
    }

    #[test]
    fn random_resized_crop_stays_inside_image() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let (x, y, w, h) =
                random_resized_crop_params(64, 48, DEFAULT_SCALE, DEFAULT_RATIO, &mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= 64);
            assert!(y + h <= 48);
        }
    }

    #[test]
    fn random_resized_crop_falls_back_to_clamped_center() {
        let mut rng = StdRng::seed_from_u64(1);
        // A scale window larger than the image can never fit, forcing the fallback.
        let (x, y, w, h) = random_resized_crop_params(100, 10, (50.0, 60.0), DEFAULT_RATIO, &mut rng);
        assert_eq!((w, h), (13, 10));
        assert_eq!((x, y), (43, 0));
    }

    #[test]
    fn normalization_uses_channel_statistics() {
        let pipeline = TransformPipeline::default();
        let img = RgbImage::from_pixel(1, 1, image::Rgb([255, 0, 255]));
        let mut rng = StdRng::seed_from_u64(0);
        let (chw, w, h) = pipeline.apply(img, &mut rng);
        assert_eq!((w, h), (1, 1));
        assert!((chw[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((chw[1] - (0.0 - 0.456) / 0.224).abs() < 1e-5);
        assert!((chw[2] - (1.0 - 0.406) / 0.225).abs() < 1e-5);
    }

    #[test]
    fn interpolation_parses_lowercase_names() {
        assert_eq!("bilinear".parse::<Interpolation>(), Ok(Interpolation::Bilinear));
        assert_eq!("BICUBIC".parse::<Interpolation>(), Ok(Interpolation::Bicubic));
        assert!("hamming".parse::<Interpolation>().is_err());
    }
}

#![allow(dead_code)]

use anyhow::Result;
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};

pub const CLASSES: [&str; 3] = ["circle", "square", "triangle"];

fn write_image(path: &Path, w: u32, h: u32, seed: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let img = RgbImage::from_fn(w, h, |x, y| {
        let v = (x * 31 + y * 17 + seed * 53) % 256;
        image::Rgb([v as u8, (255 - v) as u8, ((v * 3) % 256) as u8])
    });
    img.save(path)?;
    Ok(())
}

/// `<root>/train` with `per_class_train` images per class and `<root>/val` with
/// `per_class_val`, each class tinted differently.
pub fn synthetic_split(root: &Path, per_class_train: u32, per_class_val: u32) -> Result<(PathBuf, PathBuf)> {
    let train = root.join("train");
    let val = root.join("val");
    for (c, class) in CLASSES.iter().enumerate() {
        for i in 0..per_class_train {
            write_image(&train.join(class).join(format!("{i}.png")), 12 + i, 10, c as u32 * 10 + i)?;
        }
        for i in 0..per_class_val {
            write_image(&val.join(class).join(format!("{i}.png")), 11, 13 + i, c as u32 * 7 + i)?;
        }
    }
    Ok((train, val))
}

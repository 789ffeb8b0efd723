//! Labeled image datasets laid out as `<root>/<class_name>/**/<image>`.

use crate::transform::TransformPipeline;
use crate::types::{DatasetError, DatasetResult, ImageSample};
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions accepted as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    class_to_idx: BTreeMap<String, usize>,
    samples: Vec<(PathBuf, usize)>,
    pipeline: TransformPipeline,
}

impl ImageFolder {
    /// Index every class directory under `root`. Class indices follow sorted directory names.
    pub fn open(root: impl AsRef<Path>, pipeline: TransformPipeline) -> DatasetResult<Self> {
        let root = root.as_ref().to_path_buf();
        let classes = find_classes(&root)?;
        let class_to_idx: BTreeMap<String, usize> = classes
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let before = samples.len();
            let class_dir = root.join(class);
            for entry in WalkDir::new(&class_dir)
                .follow_links(true)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| class_dir.clone());
                    DatasetError::io(path, e.into())
                })?;
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    samples.push((entry.into_path(), label));
                }
            }
            if samples.len() == before {
                return Err(DatasetError::EmptyClass {
                    root: root.clone(),
                    class: class.clone(),
                });
            }
        }

        tracing::debug!(
            root = %root.display(),
            classes = classes.len(),
            samples = samples.len(),
            "indexed image folder"
        );

        Ok(Self {
            root,
            classes,
            class_to_idx,
            samples,
            pipeline,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn class_to_idx(&self) -> &BTreeMap<String, usize> {
        &self.class_to_idx
    }

    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    /// Decode sample `index` and run the transform pipeline.
    ///
    /// With a seeded pipeline the augmentation draws are a pure function of
    /// `(seed, epoch, index)`, so parallel decoding stays reproducible.
    pub fn get(&self, index: usize, epoch: u64) -> DatasetResult<ImageSample> {
        let (path, label) = self
            .samples
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })?;
        let img = image::open(path)
            .map_err(|source| DatasetError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();

        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.pipeline.seed {
            let mixed = seed ^ epoch.rotate_left(32) ^ index as u64;
            seeded_rng = rand::rngs::StdRng::seed_from_u64(mixed);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let (image_chw, width, height) = self.pipeline.apply(img, rng);
        Ok(ImageSample {
            image_chw,
            width,
            height,
            label: *label,
            path: path.clone(),
        })
    }
}

fn find_classes(root: &Path) -> DatasetResult<Vec<String>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| DatasetError::io(root, e))? {
        let entry = entry.map_err(|e| DatasetError::io(root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
            classes.push(name.to_string());
        }
    }
    if classes.is_empty() {
        return Err(DatasetError::NoClasses {
            root: root.to_path_buf(),
        });
    }
    classes.sort();
    Ok(classes)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

use anyhow::Result;
use burn_ndarray::NdArray;
use image::RgbImage;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use vision_dataset::{
    BatchLoader, DatasetError, DistributedSampler, ImageFolder, Interpolation, TransformPipeline,
};

type B = NdArray<f32>;

fn write_image(path: &Path, w: u32, h: u32, rgb: [u8; 3]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    RgbImage::from_pixel(w, h, image::Rgb(rgb)).save(path)?;
    Ok(())
}

/// Two classes ("cat" has 3 images, "dog" has 2, one nested) of varying sizes.
fn synthetic_folder(root: &Path) -> Result<()> {
    write_image(&root.join("dog/a.png"), 20, 12, [0, 0, 255])?;
    write_image(&root.join("dog/nested/b.PNG"), 16, 16, [0, 0, 200])?;
    write_image(&root.join("cat/1.png"), 10, 14, [255, 0, 0])?;
    write_image(&root.join("cat/2.png"), 12, 12, [200, 0, 0])?;
    write_image(&root.join("cat/3.png"), 18, 9, [150, 0, 0])?;
    fs::write(root.join("cat/notes.txt"), b"ignored")?;
    fs::write(root.join("README.md"), b"not a class")?;
    Ok(())
}

#[test]
fn classes_are_sorted_and_samples_labeled() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_folder(tmp.path())?;

    let folder = ImageFolder::open(tmp.path(), TransformPipeline::default())?;
    assert_eq!(folder.classes(), &["cat".to_string(), "dog".to_string()]);
    assert_eq!(folder.class_to_idx()["dog"], 1);
    assert_eq!(folder.len(), 5);
    let labels: Vec<usize> = folder.samples().iter().map(|(_, l)| *l).collect();
    assert_eq!(labels, vec![0, 0, 0, 1, 1]);
    Ok(())
}

#[test]
fn empty_class_is_an_error() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_folder(tmp.path())?;
    fs::create_dir_all(tmp.path().join("empty"))?;
    let err = ImageFolder::open(tmp.path(), TransformPipeline::default()).unwrap_err();
    assert!(matches!(err, DatasetError::EmptyClass { ref class, .. } if class == "empty"));
    Ok(())
}

#[test]
fn root_without_classes_is_an_error() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let err = ImageFolder::open(tmp.path(), TransformPipeline::default()).unwrap_err();
    assert!(matches!(err, DatasetError::NoClasses { .. }));
    Ok(())
}

#[test]
fn eval_pipeline_batches_to_fixed_size() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_folder(tmp.path())?;
    let pipeline = TransformPipeline::eval(10, 8, Interpolation::Bilinear);
    let folder = Arc::new(ImageFolder::open(tmp.path(), pipeline)?);

    let sampler = DistributedSampler::new(folder.len(), 1, 0)?.with_shuffle(false);
    let loader = BatchLoader::new(folder, 2);
    assert_eq!(loader.len(&sampler), 3);

    let device = Default::default();
    let mut iter = loader.iter(&sampler);
    let mut sizes = Vec::new();
    let mut labels = Vec::new();
    while let Some(batch) = iter.next_batch::<B>(&device)? {
        assert_eq!(&batch.images.dims()[1..], &[3, 8, 8]);
        sizes.push(batch.len());
        labels.extend(
            batch
                .targets
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .unwrap_or_default(),
        );
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(labels, vec![0, 0, 0, 1, 1]);
    assert_eq!(iter.processed_samples(), 5);
    Ok(())
}

#[test]
fn train_pipeline_shards_across_ranks() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_folder(tmp.path())?;
    let pipeline = TransformPipeline::train(6, Interpolation::Nearest, 0.5).with_seed(Some(11));
    let folder = Arc::new(ImageFolder::open(tmp.path(), pipeline)?);
    let device = Default::default();

    let mut total = 0;
    for rank in 0..2 {
        let mut sampler = DistributedSampler::new(folder.len(), 2, rank)?.with_seed(11);
        sampler.set_epoch(1);
        assert_eq!(sampler.len(), 3);
        let loader = BatchLoader::new(Arc::clone(&folder), 4).with_drop_last(true);
        assert_eq!(loader.len(&sampler), 0);
        let loader = BatchLoader::new(Arc::clone(&folder), 4);
        let mut iter = loader.iter(&sampler);
        while let Some(batch) = iter.next_batch::<B>(&device)? {
            assert_eq!(batch.images.dims(), [batch.len(), 3, 6, 6]);
            total += batch.len();
        }
    }
    // Five samples padded to six across two ranks.
    assert_eq!(total, 6);
    Ok(())
}

#[test]
fn seeded_augmentation_is_reproducible() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_folder(tmp.path())?;
    let pipeline = TransformPipeline::train(5, Interpolation::Bilinear, 0.5).with_seed(Some(3));
    let folder = ImageFolder::open(tmp.path(), pipeline)?;
    let a = folder.get(2, 4)?;
    let b = folder.get(2, 4)?;
    assert_eq!(a.image_chw, b.image_chw);
    assert_eq!((a.width, a.height), (5, 5));
    Ok(())
}

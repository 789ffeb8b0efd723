use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{ImageClassifier, ResNet, ResNetConfig, ResNetDepth};

type B = NdArray<f32>;

#[test]
fn resnet18_logits_have_class_dimension() {
    let device = Default::default();
    let model: ResNet<B> = ResNetConfig::new(ResNetDepth::R18, 7).init(&device);
    let images = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);
    let logits = model.forward(images);
    assert_eq!(logits.dims(), [2, 7]);
    assert_eq!(model.num_classes(), 7);
}

#[test]
fn resnet50_features_are_expanded() {
    let device = Default::default();
    let model: ResNet<B> = ResNetConfig::new(ResNetDepth::R50, 3).init(&device);
    let images = Tensor::<B, 4>::ones([1, 3, 32, 32], &device);
    let features = model.features(images.clone());
    assert_eq!(features.dims(), [1, 2048]);
    assert_eq!(model.forward(images).dims(), [1, 3]);
}

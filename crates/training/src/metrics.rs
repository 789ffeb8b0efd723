//! Top-k classification accuracy.

use crate::error::{TrainError, TrainResult};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// The `k` values reported by evaluation (`Acc@1`, `Acc@5`).
pub const DEFAULT_TOPK: [usize; 2] = [1, 5];

/// Count, for each `k` in `topk`, how many rows have their target among the k best scores.
///
/// `scores` is row-major `[targets.len(), num_classes]`. Ties rank the lower class index
/// first, so a row whose target ties with a lower class needs a larger k to count. NaN
/// ranks above every number, matching `torch.topk`.
pub fn topk_correct(
    scores: &[f32],
    num_classes: usize,
    targets: &[usize],
    topk: &[usize],
) -> TrainResult<Vec<usize>> {
    if num_classes == 0 {
        return Err(TrainError::Accuracy("output has no classes".into()));
    }
    if scores.len() != targets.len() * num_classes {
        return Err(TrainError::Accuracy(format!(
            "score buffer of {} does not match {} rows x {} classes",
            scores.len(),
            targets.len(),
            num_classes
        )));
    }

    let mut correct = vec![0usize; topk.len()];
    for (row, &target) in scores.chunks_exact(num_classes).zip(targets) {
        if target >= num_classes {
            return Err(TrainError::Accuracy(format!(
                "target class {target} out of range for {num_classes} classes"
            )));
        }
        let t = row[target];
        let rank = row
            .iter()
            .enumerate()
            .filter(|&(c, &s)| outranks(s, c, t, target))
            .count();
        for (slot, &k) in correct.iter_mut().zip(topk) {
            if rank < k.min(num_classes) {
                *slot += 1;
            }
        }
    }
    Ok(correct)
}

fn outranks(score: f32, class: usize, target_score: f32, target: usize) -> bool {
    match (score.is_nan(), target_score.is_nan()) {
        (true, false) => true,
        (false, true) => false,
        (true, true) => class < target,
        (false, false) => score > target_score || (score == target_score && class < target),
    }
}

/// Top-k accuracy in percent (0–100) for each `k` in `topk`.
pub fn accuracy<B: Backend>(
    output: Tensor<B, 2>,
    target: Tensor<B, 1, Int>,
    topk: &[usize],
) -> TrainResult<Vec<f32>> {
    let [batch_size, num_classes] = output.dims();
    if batch_size == 0 {
        return Err(TrainError::Accuracy("empty batch".into()));
    }
    let scores = tensor_to_f32(output)?;
    let targets = targets_to_usize(target)?;
    let correct = topk_correct(&scores, num_classes, &targets, topk)?;
    Ok(correct
        .into_iter()
        .map(|c| c as f32 * (100.0 / batch_size as f32))
        .collect())
}

/// Like [`accuracy`] for one-hot or soft labels `[batch, num_classes]`; the class is the
/// arg-max of each target row.
pub fn accuracy_soft<B: Backend>(
    output: Tensor<B, 2>,
    target: Tensor<B, 2>,
    topk: &[usize],
) -> TrainResult<Vec<f32>> {
    let [batch_size, _] = target.dims();
    let hard = target.argmax(1).reshape([batch_size]);
    accuracy(output, hard, topk)
}

pub(crate) fn tensor_to_f32<B: Backend, const D: usize>(t: Tensor<B, D>) -> TrainResult<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(TrainError::tensor_data)
}

pub(crate) fn targets_to_usize<B: Backend>(t: Tensor<B, 1, Int>) -> TrainResult<Vec<usize>> {
    let raw = t
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(TrainError::tensor_data)?;
    raw.into_iter()
        .map(|v| {
            usize::try_from(v)
                .map_err(|_| TrainError::Accuracy(format!("negative target class {v}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn counts_hits_within_k() {
        // Row 0: target 2 is best. Row 1: target 0 is third best. Row 2: target 1 is worst.
        let scores = [
            0.1, 0.2, 0.9, 0.0, //
            0.5, 0.9, 0.1, 0.7, //
            0.4, 0.0, 0.3, 0.2,
        ];
        let correct = topk_correct(&scores, 4, &[2, 0, 1], &[1, 2, 3, 4]).unwrap();
        assert_eq!(correct, vec![1, 1, 2, 3]);
    }

    #[test]
    fn ties_favor_lower_class_index() {
        let scores = [0.5, 0.5, 0.5];
        assert_eq!(topk_correct(&scores, 3, &[0], &[1]).unwrap(), vec![1]);
        assert_eq!(topk_correct(&scores, 3, &[2], &[1, 2, 3]).unwrap(), vec![0, 0, 1]);
    }

    #[test]
    fn k_beyond_class_count_counts_every_row() {
        let scores = [0.0, 1.0, 1.0, 0.0];
        assert_eq!(topk_correct(&scores, 2, &[0, 1], &[5]).unwrap(), vec![2]);
    }

    #[test]
    fn nan_scores_rank_first() {
        // A NaN elsewhere pushes the target down one place.
        let scores = [0.9, f32::NAN, 0.1];
        assert_eq!(topk_correct(&scores, 3, &[0], &[1, 2]).unwrap(), vec![0, 1]);
        // A NaN target beats finite scores but not an earlier NaN.
        let scores = [f32::NAN, 0.5, f32::NAN];
        assert_eq!(topk_correct(&scores, 3, &[2], &[1, 2]).unwrap(), vec![0, 1]);
        assert_eq!(topk_correct(&scores, 3, &[0], &[1]).unwrap(), vec![1]);
    }

    #[test]
    fn rejects_out_of_range_targets() {
        assert!(topk_correct(&[0.0, 1.0], 2, &[2], &[1]).is_err());
        assert!(topk_correct(&[0.0, 1.0, 2.0], 2, &[0], &[1]).is_err());
    }

    #[test]
    fn tensor_accuracy_reports_percentages() {
        let device = Default::default();
        let output = Tensor::<B, 2>::from_data(
            TensorData::new(vec![3.0f32, 1.0, 0.0, 0.0, 1.0, 3.0, 2.0, 1.0, 0.0, 5.0, 1.0, 0.0], [4, 3]),
            &device,
        );
        let target = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 2, 1], [4]), &device);
        let acc = accuracy(output, target, &DEFAULT_TOPK).unwrap();
        assert!((acc[0] - 25.0).abs() < 1e-4);
        assert!((acc[1] - 100.0).abs() < 1e-4);
    }

    #[test]
    fn empty_batch_is_an_error() {
        let device = Default::default();
        let output = Tensor::<B, 2>::zeros([0, 3], &device);
        let target = Tensor::<B, 1, Int>::from_data(TensorData::new(Vec::<i64>::new(), [0]), &device);
        let err = accuracy(output, target, &DEFAULT_TOPK).unwrap_err();
        assert!(matches!(err, TrainError::Accuracy(_)));
    }

    #[test]
    fn soft_targets_use_argmax() {
        let device = Default::default();
        let output = Tensor::<B, 2>::from_data(TensorData::new(vec![0.1f32, 0.9, 0.8, 0.2], [2, 2]), &device);
        let target = Tensor::<B, 2>::from_data(TensorData::new(vec![0.0f32, 1.0, 0.7, 0.3], [2, 2]), &device);
        let acc = accuracy_soft(output, target, &[1]).unwrap();
        assert!((acc[0] - 100.0).abs() < 1e-4);
    }
}

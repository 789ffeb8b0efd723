//! Rank-aware sampling: each replica iterates a disjoint shard of the dataset.

use crate::types::{DatasetError, DatasetResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits `0..dataset_len` into `num_replicas` equally sized shards.
///
/// Without `drop_last` the index list is padded by repeating its head so every rank gets
/// `ceil(len / num_replicas)` samples; with `drop_last` the tail is cut instead. When
/// shuffling, all ranks derive the same permutation from `seed + epoch`, so the shards stay
/// disjoint. Call [`DistributedSampler::set_epoch`] before each epoch to reshuffle.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    drop_last: bool,
    epoch: u64,
    num_samples: usize,
    total_size: usize,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, num_replicas: usize, rank: usize) -> DatasetResult<Self> {
        if num_replicas == 0 {
            return Err(DatasetError::NoReplicas);
        }
        if rank >= num_replicas {
            return Err(DatasetError::InvalidRank { rank, num_replicas });
        }
        let mut sampler = Self {
            dataset_len,
            num_replicas,
            rank,
            shuffle: true,
            seed: 0,
            drop_last: false,
            epoch: 0,
            num_samples: 0,
            total_size: 0,
        };
        sampler.recompute_sizes();
        Ok(sampler)
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self.recompute_sizes();
        self
    }

    fn recompute_sizes(&mut self) {
        self.num_samples = if self.drop_last {
            self.dataset_len / self.num_replicas
        } else {
            self.dataset_len.div_ceil(self.num_replicas)
        };
        self.total_size = self.num_samples * self.num_replicas;
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset_len
    }

    /// Samples in this rank's shard.
    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Dataset indices for this rank and the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        let padded: Vec<usize> = if indices.is_empty() {
            indices
        } else {
            indices.iter().copied().cycle().take(self.total_size).collect()
        };

        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn rejects_rank_outside_world() {
        assert!(matches!(
            DistributedSampler::new(10, 2, 2),
            Err(DatasetError::InvalidRank { rank: 2, num_replicas: 2 })
        ));
        assert!(matches!(
            DistributedSampler::new(10, 0, 0),
            Err(DatasetError::NoReplicas)
        ));
    }

    #[test]
    fn pads_uneven_datasets_by_wrapping() {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| {
                DistributedSampler::new(7, 3, rank)
                    .unwrap()
                    .with_shuffle(false)
                    .indices()
            })
            .collect();
        assert_eq!(shards[0], vec![0, 3, 6]);
        assert_eq!(shards[1], vec![1, 4, 0]);
        assert_eq!(shards[2], vec![2, 5, 1]);
    }

    #[test]
    fn drop_last_truncates_tail() {
        let sampler = DistributedSampler::new(7, 3, 1)
            .unwrap()
            .with_shuffle(false)
            .with_drop_last(true);
        assert_eq!(sampler.len(), 2);
        assert_eq!(sampler.indices(), vec![1, 4]);
    }

    #[test]
    fn shuffled_shards_are_disjoint_and_cover_dataset() {
        let mut seen = BTreeSet::new();
        let mut total = 0;
        for rank in 0..4 {
            let mut sampler = DistributedSampler::new(20, 4, rank).unwrap().with_seed(3);
            sampler.set_epoch(5);
            let idx = sampler.indices();
            assert_eq!(idx.len(), sampler.len());
            total += idx.len();
            seen.extend(idx);
        }
        assert_eq!(total, 20);
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn epoch_changes_permutation() {
        let mut sampler = DistributedSampler::new(64, 2, 0).unwrap();
        sampler.set_epoch(1);
        let first = sampler.indices();
        sampler.set_epoch(2);
        let second = sampler.indices();
        assert_ne!(first, second);
        sampler.set_epoch(1);
        assert_eq!(sampler.indices(), first);
    }

    #[test]
    fn tiny_dataset_repeats_to_fill_every_rank() {
        let sampler = DistributedSampler::new(1, 4, 3).unwrap().with_shuffle(false);
        assert_eq!(sampler.len(), 1);
        assert_eq!(sampler.indices(), vec![0]);
    }
}

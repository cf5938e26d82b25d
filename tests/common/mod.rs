#![allow(dead_code)]

use std::path::Path;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use ring_orchestra::{MetricValue, Metrics, Model, TrainerConfig};

pub const INPUTS: usize = 32;
pub const OUTPUTS: usize = 2;

/// A linear `32 -> 2` layer regressing its outputs towards one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoringModel {
    params: Vec<f32>,
}

impl BoringModel {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(42);
        let params = (0..INPUTS * OUTPUTS + OUTPUTS)
            .map(|_| rng.random_range(-0.1..0.1))
            .collect();

        Self { params }
    }

    fn input(batch_idx: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(batch_idx as u64);
        (0..INPUTS).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        let (weights, bias) = self.params.split_at(INPUTS * OUTPUTS);

        weights
            .chunks(INPUTS)
            .zip(bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect()
    }

    fn loss(&self, batch_idx: usize) -> f32 {
        let out = self.forward(&Self::input(batch_idx));
        out.iter().map(|o| (o - 1.0).powi(2)).sum::<f32>() / OUTPUTS as f32
    }
}

impl Model for BoringModel {
    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn training_step(&self, batch_idx: usize, grad: &mut [f32]) -> f32 {
        let x = Self::input(batch_idx);
        let out = self.forward(&x);
        let (gw, gb) = grad.split_at_mut(INPUTS * OUTPUTS);

        for (o, (row, b)) in out.iter().zip(gw.chunks_mut(INPUTS).zip(gb)) {
            let d = 2.0 * (o - 1.0) / OUTPUTS as f32;
            row.iter_mut().zip(&x).for_each(|(g, x)| *g = d * x);
            *b = d;
        }

        out.iter().map(|o| (o - 1.0).powi(2)).sum::<f32>() / OUTPUTS as f32
    }

    fn validation_step(&self, batch_idx: usize) -> Metrics {
        let loss = self.loss(10_000 + batch_idx) as f64;

        Metrics::from([
            ("val_loss".to_string(), MetricValue::Scalar(loss)),
            ("val_acc".to_string(), MetricValue::Scalar(1.0 / (1.0 + loss))),
        ])
    }
}

pub fn trainer_config(root: &Path) -> TrainerConfig {
    TrainerConfig {
        max_epochs: 3,
        limit_train_batches: 4,
        limit_val_batches: 2,
        num_sanity_val_steps: 2,
        learning_rate: 0.05,
        default_root_dir: root.to_path_buf(),
        ..Default::default()
    }
}

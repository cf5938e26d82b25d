use std::{env, sync::Arc};

use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};

use ring_orchestra::{
    AcceleratorConfig, CallbackSpec, Cluster, ClusterSpec, HostSpec, MetricSelection, MetricValue,
    Metrics, Model, RingAccelerator, Trainer, TrainerConfig, Trial,
};

const SAMPLES_PER_BATCH: usize = 16;

/// Fits `y = 2x - 1` on a synthetic dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Linear {
    params: Vec<f32>,
}

impl Linear {
    fn batch(batch_idx: usize) -> impl Iterator<Item = (f32, f32)> {
        (0..SAMPLES_PER_BATCH).map(move |i| {
            let x = ((batch_idx * SAMPLES_PER_BATCH + i) % 97) as f32 / 97.0;
            (x, 2.0 * x - 1.0)
        })
    }

    fn loss(&self, batch_idx: usize, grad: Option<&mut [f32]>) -> f32 {
        let (w, b) = (self.params[0], self.params[1]);
        let n = SAMPLES_PER_BATCH as f32;

        let mut loss = 0.0;
        let mut gw = 0.0;
        let mut gb = 0.0;
        for (x, y) in Self::batch(batch_idx) {
            let err = w * x + b - y;
            loss += err * err / n;
            gw += 2.0 * err * x / n;
            gb += 2.0 * err / n;
        }

        if let Some(grad) = grad {
            grad[0] = gw;
            grad[1] = gb;
        }

        loss
    }
}

impl Model for Linear {
    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn training_step(&self, batch_idx: usize, grad: &mut [f32]) -> f32 {
        self.loss(batch_idx, Some(grad))
    }

    fn validation_step(&self, batch_idx: usize) -> Metrics {
        let loss = self.loss(batch_idx + 1000, None);
        Metrics::from([("val_loss".to_string(), MetricValue::from(loss))])
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let accelerator_config = match env::args().nth(1) {
        Some(path) => AcceleratorConfig::from_json_file(&path)
            .with_context(|| format!("failed to load accelerator config from {path}"))?,
        None => AcceleratorConfig::new(1, 2, false)?,
    };

    let root = env::temp_dir().join("ring-orchestra");
    let trial = Arc::new(Trial::new(root.join("trial")));

    // One simulated host per requested host, sized to fit its slots.
    let slots = accelerator_config.num_slots.get();
    let host = HostSpec {
        cpus: slots,
        gpus: if accelerator_config.use_gpu { slots } else { 0 },
    };
    let cluster = Cluster::new(ClusterSpec {
        hosts: vec![host; accelerator_config.num_hosts.get()],
    });
    let mut accelerator =
        RingAccelerator::new(cluster, accelerator_config)?.with_tuner(trial.clone());

    let config = TrainerConfig {
        max_epochs: 5,
        limit_train_batches: 8,
        limit_val_batches: 4,
        learning_rate: 0.5,
        default_root_dir: root,
        ..Default::default()
    };

    let mut trainer = Trainer::new(config).with_callback(CallbackSpec::report_checkpoint(
        MetricSelection::rename([("loss", "val_loss")]),
        "checkpoint",
    ));

    let model = Linear {
        params: vec![0.0, 0.0],
    };

    let metrics = trainer.fit(model, &mut accelerator)?;
    info!("final metrics: {}", serde_json::to_string(&metrics)?);

    if let Some(model) = trainer.model() {
        println!("learned w = {:.3}, b = {:.3}", model.params[0], model.params[1]);
    }

    for report in trial.reports() {
        println!(
            "iteration {}: {:?} (checkpoint: {:?})",
            report.training_iteration, report.metrics, report.checkpoint
        );
    }

    Ok(())
}

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use super::ReportDict;
use crate::{
    error::{OrchestraError, Result},
    session::Session,
    trainer::{checkpoint, Callback, Event, Metrics, Model, TrainingJob},
};

/// Which trainer metrics go into a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricSelection {
    /// Every metric under its own name.
    #[default]
    All,
    /// The given metrics under their own names.
    Keys(Vec<String>),
    /// Reported name to trainer metric name.
    Rename(BTreeMap<String, String>),
}

impl MetricSelection {
    pub fn rename<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Rename(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a report out of `metrics`.
    ///
    /// # Errors
    /// `MissingMetric` if a selected metric wasn't logged, `NonScalarMetric`
    /// if it doesn't hold a single value.
    pub fn select(&self, metrics: &Metrics) -> Result<ReportDict> {
        let lookup = |key: &str| -> Result<f64> {
            metrics
                .get(key)
                .ok_or_else(|| OrchestraError::MissingMetric {
                    key: key.to_string(),
                })?
                .item(key)
        };

        match self {
            Self::All => metrics
                .iter()
                .map(|(key, value)| -> Result<(String, f64)> { Ok((key.clone(), value.item(key)?)) })
                .collect(),
            Self::Keys(keys) if keys.is_empty() => Self::All.select(metrics),
            Self::Keys(keys) => keys
                .iter()
                .map(|key| -> Result<(String, f64)> { Ok((key.clone(), lookup(key)?)) })
                .collect(),
            Self::Rename(names) => names
                .iter()
                .map(|(name, key)| -> Result<(String, f64)> { Ok((name.clone(), lookup(key)?)) })
                .collect(),
        }
    }
}

impl From<&str> for MetricSelection {
    fn from(key: &str) -> Self {
        Self::Keys(vec![key.to_string()])
    }
}

impl From<String> for MetricSelection {
    fn from(key: String) -> Self {
        Self::Keys(vec![key])
    }
}

impl From<Vec<String>> for MetricSelection {
    fn from(keys: Vec<String>) -> Self {
        Self::Keys(keys)
    }
}

impl<const N: usize> From<[&str; N]> for MetricSelection {
    fn from(keys: [&str; N]) -> Self {
        Self::Keys(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl From<BTreeMap<String, String>> for MetricSelection {
    fn from(names: BTreeMap<String, String>) -> Self {
        Self::Rename(names)
    }
}

fn default_on() -> Vec<Event> {
    vec![Event::ValidationEnd]
}

fn default_filename() -> String {
    "checkpoint".to_string()
}

/// The events a reporting callback fires on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    on: Vec<Event>,
}

impl Trigger {
    pub fn new(on: Vec<Event>) -> Self {
        Self { on }
    }

    /// Parses hook names such as `validation_end` or `on_batch_end`.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let on = names
            .iter()
            .map(|name| name.as_ref().parse::<Event>())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { on })
    }

    pub fn fires(&self, event: Event) -> bool {
        self.on.contains(&event)
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self { on: default_on() }
    }
}

/// Reports the selected metrics of rank 0 to the tuner.
pub struct MetricReporter {
    trigger: Trigger,
    selection: MetricSelection,
    session: Session,
}

impl MetricReporter {
    pub fn new(trigger: Trigger, selection: MetricSelection, session: Session) -> Self {
        Self {
            trigger,
            selection,
            session,
        }
    }

    fn handle<M: Model>(&self, job: &TrainingJob<M>) -> Result<()> {
        if self.session.rank() != 0 || job.state.running_sanity_check {
            return Ok(());
        }

        let report = self.selection.select(&job.state.callback_metrics)?;
        self.session.put_queue(move |tuner| tuner.report(&report))
    }
}

impl<M: Model> Callback<M> for MetricReporter {
    fn on_event(&mut self, event: Event, job: &TrainingJob<M>) -> Result<()> {
        if !self.trigger.fires(event) {
            return Ok(());
        }

        self.handle(job)
    }
}

/// Saves a snapshot of the training state into the tuner's checkpoint directory.
pub struct CheckpointReporter {
    trigger: Trigger,
    filename: String,
    session: Session,
}

impl CheckpointReporter {
    pub fn new(trigger: Trigger, filename: String, session: Session) -> Self {
        Self {
            trigger,
            filename,
            session,
        }
    }

    fn handle<M: Model>(&self, job: &TrainingJob<M>) -> Result<()> {
        if job.state.running_sanity_check {
            return Ok(());
        }

        // Every rank takes the snapshot, only rank 0 relays it.
        let snapshot = job.dump_checkpoint();
        if self.session.rank() != 0 {
            return Ok(());
        }

        let step = job.state.global_step;
        let filename = self.filename.clone();
        debug!(step = step; "relaying checkpoint");

        self.session.put_queue(move |tuner| {
            let dir = tuner.checkpoint_dir(step)?;
            checkpoint::atomic_save(&snapshot, &dir.join(filename))
        })
    }
}

impl<M: Model> Callback<M> for CheckpointReporter {
    fn on_event(&mut self, event: Event, job: &TrainingJob<M>) -> Result<()> {
        if !self.trigger.fires(event) {
            return Ok(());
        }

        self.handle(job)
    }
}

/// Saves a checkpoint and reports the metrics in the same step, so the
/// report is bound to that checkpoint.
pub struct ReportCheckpoint {
    trigger: Trigger,
    checkpoint: CheckpointReporter,
    report: MetricReporter,
}

impl ReportCheckpoint {
    pub fn new(
        trigger: Trigger,
        selection: MetricSelection,
        filename: String,
        session: Session,
    ) -> Self {
        Self {
            checkpoint: CheckpointReporter::new(trigger.clone(), filename, session.clone()),
            report: MetricReporter::new(trigger.clone(), selection, session),
            trigger,
        }
    }
}

impl<M: Model> Callback<M> for ReportCheckpoint {
    fn on_event(&mut self, event: Event, job: &TrainingJob<M>) -> Result<()> {
        if !self.trigger.fires(event) {
            return Ok(());
        }

        self.checkpoint.handle(job)?;
        self.report.handle(job)
    }
}

/// A serializable description of a reporting callback, built on each worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackSpec {
    Report {
        #[serde(default)]
        metrics: MetricSelection,
        #[serde(default = "default_on")]
        on: Vec<Event>,
    },
    Checkpoint {
        #[serde(default = "default_filename")]
        filename: String,
        #[serde(default = "default_on")]
        on: Vec<Event>,
    },
    ReportCheckpoint {
        #[serde(default)]
        metrics: MetricSelection,
        #[serde(default = "default_filename")]
        filename: String,
        #[serde(default = "default_on")]
        on: Vec<Event>,
    },
}

impl CallbackSpec {
    pub fn report<S: Into<MetricSelection>>(metrics: S) -> Self {
        Self::Report {
            metrics: metrics.into(),
            on: default_on(),
        }
    }

    pub fn checkpoint<S: Into<String>>(filename: S) -> Self {
        Self::Checkpoint {
            filename: filename.into(),
            on: default_on(),
        }
    }

    pub fn report_checkpoint<S, F>(metrics: S, filename: F) -> Self
    where
        S: Into<MetricSelection>,
        F: Into<String>,
    {
        Self::ReportCheckpoint {
            metrics: metrics.into(),
            filename: filename.into(),
            on: default_on(),
        }
    }

    /// Replaces the events the callback fires on.
    pub fn on(mut self, events: &[Event]) -> Self {
        match &mut self {
            Self::Report { on, .. } | Self::Checkpoint { on, .. } | Self::ReportCheckpoint { on, .. } => {
                *on = events.to_vec();
            }
        }

        self
    }

    /// Same as `on`, from hook names.
    ///
    /// # Errors
    /// `InvalidConfig` if a name is not a trainer event.
    pub fn on_names<S: AsRef<str>>(self, names: &[S]) -> Result<Self> {
        let trigger = Trigger::parse(names)?;
        Ok(self.on(&trigger.on))
    }

    /// Instantiates the callback bound to `session`.
    pub fn build<M: Model>(&self, session: Session) -> Box<dyn Callback<M>> {
        match self.clone() {
            Self::Report { metrics, on } => {
                Box::new(MetricReporter::new(Trigger::new(on), metrics, session))
            }
            Self::Checkpoint { filename, on } => {
                Box::new(CheckpointReporter::new(Trigger::new(on), filename, session))
            }
            Self::ReportCheckpoint {
                metrics,
                filename,
                on,
            } => Box::new(ReportCheckpoint::new(
                Trigger::new(on),
                metrics,
                filename,
                session,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::MetricValue;

    fn metrics() -> Metrics {
        Metrics::from([
            ("val_loss".to_string(), MetricValue::Scalar(0.25)),
            ("val_acc".to_string(), MetricValue::Tensor(vec![0.75])),
            ("hist".to_string(), MetricValue::Tensor(vec![1.0, 2.0])),
        ])
    }

    #[test]
    fn selections_pick_and_rename_metrics() {
        let metrics = metrics();

        let subset = MetricSelection::from("val_loss").select(&metrics).unwrap();
        assert_eq!(subset, ReportDict::from([("val_loss".to_string(), 0.25)]));

        let renamed = MetricSelection::rename([("acc", "val_acc")])
            .select(&metrics)
            .unwrap();
        assert_eq!(renamed, ReportDict::from([("acc".to_string(), 0.75)]));
    }

    #[test]
    fn selecting_everything_requires_scalars() {
        let err = MetricSelection::All.select(&metrics()).unwrap_err();
        assert!(matches!(err, OrchestraError::NonScalarMetric { ref key, len: 2 } if key == "hist"));
    }

    #[test]
    fn empty_key_lists_select_everything() {
        let mut metrics = metrics();
        metrics.remove("hist");

        let report = MetricSelection::Keys(Vec::new()).select(&metrics).unwrap();
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn missing_keys_are_usage_errors() {
        let err = MetricSelection::from(["val_loss", "val_f1"])
            .select(&metrics())
            .unwrap_err();
        assert!(matches!(err, OrchestraError::MissingMetric { ref key } if key == "val_f1"));
    }

    #[test]
    fn specs_deserialize_with_defaults() {
        let spec: CallbackSpec =
            serde_json::from_str(r#"{"kind": "report_checkpoint", "metrics": {"loss": "val_loss"}}"#)
                .unwrap();

        assert_eq!(
            spec,
            CallbackSpec::report_checkpoint(MetricSelection::rename([("loss", "val_loss")]), "checkpoint")
        );
    }

    #[test]
    fn unknown_hook_names_are_rejected() {
        let err = CallbackSpec::report("loss")
            .on_names(&["on_validation_finish"])
            .unwrap_err();
        assert!(matches!(err, OrchestraError::InvalidConfig(_)));

        let spec = CallbackSpec::report("loss").on_names(&["on_batch_end"]).unwrap();
        assert_eq!(spec, CallbackSpec::report("loss").on(&[Event::BatchEnd]));
    }
}

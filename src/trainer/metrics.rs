use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestraError, Result};

/// The trainer's logged metrics keyed by name.
pub type Metrics = BTreeMap<String, MetricValue>;

/// A logged metric, either a plain scalar or a flat tensor.
///
/// JSON has no literal for non-finite numbers, they are written as the strings
/// `"NaN"`, `"inf"` and `"-inf"` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Repr", try_from = "Repr")]
pub enum MetricValue {
    Scalar(f64),
    Tensor(Vec<f64>),
}

/// The wire form of a single metric value.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Number {
    Finite(f64),
    Special(String),
}

impl Number {
    fn new(value: f64) -> Self {
        match value {
            v if v.is_finite() => Self::Finite(v),
            v if v.is_nan() => Self::Special("NaN".to_string()),
            v if v > 0.0 => Self::Special("inf".to_string()),
            _ => Self::Special("-inf".to_string()),
        }
    }

    fn value(self) -> std::result::Result<f64, String> {
        match self {
            Self::Finite(v) => Ok(v),
            Self::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                _ => Err(format!("`{s}` is not a metric value")),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Scalar(Number),
    Tensor(Vec<Number>),
}

impl From<MetricValue> for Repr {
    fn from(value: MetricValue) -> Self {
        match value {
            MetricValue::Scalar(v) => Self::Scalar(Number::new(v)),
            MetricValue::Tensor(values) => {
                Self::Tensor(values.into_iter().map(Number::new).collect())
            }
        }
    }
}

impl TryFrom<Repr> for MetricValue {
    type Error = String;

    fn try_from(repr: Repr) -> std::result::Result<Self, Self::Error> {
        match repr {
            Repr::Scalar(n) => n.value().map(Self::Scalar),
            Repr::Tensor(numbers) => numbers
                .into_iter()
                .map(Number::value)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::Tensor),
        }
    }
}

impl MetricValue {
    /// Converts the value into a scalar.
    ///
    /// # Arguments
    /// * `key` - The metric's name, used for error reporting.
    ///
    /// # Returns
    /// The scalar or `NonScalarMetric` if the tensor doesn't hold exactly one element.
    pub fn item(&self, key: &str) -> Result<f64> {
        match self {
            Self::Scalar(v) => Ok(*v),
            Self::Tensor(values) if values.len() == 1 => Ok(values[0]),
            Self::Tensor(values) => Err(OrchestraError::NonScalarMetric {
                key: key.to_string(),
                len: values.len(),
            }),
        }
    }

    /// The flat values of this metric.
    pub fn values(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Tensor(values) => values,
        }
    }

    /// Builds a metric with the same shape as `self` from the given values.
    pub(crate) fn with_values(&self, values: &[f64]) -> Self {
        match self {
            Self::Scalar(_) => Self::Scalar(values[0]),
            Self::Tensor(_) => Self::Tensor(values.to_vec()),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<f32> for MetricValue {
    fn from(value: f32) -> Self {
        Self::Scalar(value as f64)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Tensor(values)
    }
}

/// Accumulates per-batch metrics into an elementwise running sum.
#[derive(Debug, Default)]
pub(crate) struct MetricAccumulator {
    sums: Metrics,
    count: usize,
}

impl MetricAccumulator {
    pub fn push(&mut self, metrics: Metrics) {
        self.count += 1;

        for (key, value) in metrics {
            match self.sums.get_mut(&key) {
                Some(sum) => {
                    let added: Vec<f64> = sum
                        .values()
                        .iter()
                        .zip(value.values())
                        .map(|(a, b)| a + b)
                        .collect();
                    *sum = sum.with_values(&added);
                }
                None => {
                    self.sums.insert(key, value);
                }
            }
        }
    }

    /// The per-batch mean of every metric seen so far.
    pub fn mean(self) -> Metrics {
        let n = self.count.max(1) as f64;

        self.sums
            .into_iter()
            .map(|(key, sum)| {
                let mean: Vec<f64> = sum.values().iter().map(|v| v / n).collect();
                let value = sum.with_values(&mean);
                (key, value)
            })
            .collect()
    }
}

/// Flattens every metric's values in key order.
pub(crate) fn flatten(metrics: &Metrics) -> Vec<f64> {
    metrics
        .values()
        .flat_map(|v| v.values().iter().copied())
        .collect()
}

/// Writes flat values back into `metrics`, in the same order `flatten` produced them.
pub(crate) fn unflatten(metrics: &mut Metrics, flat: &[f64]) {
    let mut offset = 0;

    for value in metrics.values_mut() {
        let len = value.values().len();
        *value = value.with_values(&flat[offset..offset + len]);
        offset += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_accepts_scalars_and_single_element_tensors() {
        assert_eq!(MetricValue::Scalar(1.5).item("a").unwrap(), 1.5);
        assert_eq!(MetricValue::Tensor(vec![2.0]).item("a").unwrap(), 2.0);

        let err = MetricValue::Tensor(vec![1.0, 2.0]).item("a").unwrap_err();
        assert!(matches!(err, OrchestraError::NonScalarMetric { len: 2, .. }));
    }

    #[test]
    fn accumulator_means_elementwise() {
        let mut acc = MetricAccumulator::default();
        acc.push(Metrics::from([
            ("loss".to_string(), MetricValue::Scalar(1.0)),
            ("hist".to_string(), MetricValue::Tensor(vec![1.0, 3.0])),
        ]));
        acc.push(Metrics::from([
            ("loss".to_string(), MetricValue::Scalar(3.0)),
            ("hist".to_string(), MetricValue::Tensor(vec![3.0, 5.0])),
        ]));

        let mean = acc.mean();
        assert_eq!(mean["loss"], MetricValue::Scalar(2.0));
        assert_eq!(mean["hist"], MetricValue::Tensor(vec![2.0, 4.0]));
    }

    #[test]
    fn flatten_and_unflatten_preserve_shapes() {
        let mut metrics = Metrics::from([
            ("a".to_string(), MetricValue::Tensor(vec![1.0, 2.0])),
            ("b".to_string(), MetricValue::Scalar(3.0)),
        ]);

        let mut flat = flatten(&metrics);
        assert_eq!(flat, vec![1.0, 2.0, 3.0]);

        flat.iter_mut().for_each(|v| *v *= 2.0);
        unflatten(&mut metrics, &flat);

        assert_eq!(metrics["a"], MetricValue::Tensor(vec![2.0, 4.0]));
        assert_eq!(metrics["b"], MetricValue::Scalar(6.0));
    }

    #[test]
    fn scalars_serialize_as_plain_numbers() {
        let metrics = Metrics::from([("val_loss".to_string(), MetricValue::Scalar(0.5))]);
        let json = serde_json::to_string(&metrics).unwrap();

        assert_eq!(json, r#"{"val_loss":0.5}"#);
    }

    #[test]
    fn non_finite_values_survive_json() {
        let metrics = Metrics::from([
            ("nan".to_string(), MetricValue::Scalar(f64::NAN)),
            (
                "hist".to_string(),
                MetricValue::Tensor(vec![f64::INFINITY, 1.0, f64::NEG_INFINITY]),
            ),
        ]);

        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(json, r#"{"hist":["inf",1.0,"-inf"],"nan":"NaN"}"#);

        let back: Metrics = serde_json::from_str(&json).unwrap();
        assert!(back["nan"].item("nan").unwrap().is_nan());
        assert_eq!(back["hist"], metrics["hist"]);
    }

    #[test]
    fn unknown_strings_are_not_metrics() {
        assert!(serde_json::from_str::<MetricValue>(r#""fast""#).is_err());
    }
}

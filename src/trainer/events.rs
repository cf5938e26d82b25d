use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::OrchestraError;

/// The trainer's lifecycle hooks, named without the `on_` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    FitStart,
    FitEnd,
    SanityCheckStart,
    SanityCheckEnd,
    TrainStart,
    TrainEnd,
    EpochStart,
    EpochEnd,
    BatchStart,
    BatchEnd,
    ValidationStart,
    ValidationEnd,
}

impl Event {
    pub const ALL: [Event; 12] = [
        Event::FitStart,
        Event::FitEnd,
        Event::SanityCheckStart,
        Event::SanityCheckEnd,
        Event::TrainStart,
        Event::TrainEnd,
        Event::EpochStart,
        Event::EpochEnd,
        Event::BatchStart,
        Event::BatchEnd,
        Event::ValidationStart,
        Event::ValidationEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::FitStart => "fit_start",
            Event::FitEnd => "fit_end",
            Event::SanityCheckStart => "sanity_check_start",
            Event::SanityCheckEnd => "sanity_check_end",
            Event::TrainStart => "train_start",
            Event::TrainEnd => "train_end",
            Event::EpochStart => "epoch_start",
            Event::EpochEnd => "epoch_end",
            Event::BatchStart => "batch_start",
            Event::BatchEnd => "batch_end",
            Event::ValidationStart => "validation_start",
            Event::ValidationEnd => "validation_end",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("on_").unwrap_or(s);

        Event::ALL
            .into_iter()
            .find(|event| event.as_str() == name)
            .ok_or_else(|| {
                let valid: Vec<_> = Event::ALL.iter().map(Event::as_str).collect();
                OrchestraError::InvalidConfig(format!(
                    "unknown trainer event `{s}`, expected one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_with_and_without_prefix() {
        assert_eq!("validation_end".parse::<Event>().unwrap(), Event::ValidationEnd);
        assert_eq!("on_batch_start".parse::<Event>().unwrap(), Event::BatchStart);
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let err = "validation_finish".parse::<Event>().unwrap_err();
        assert!(matches!(err, OrchestraError::InvalidConfig(_)));
    }

    #[test]
    fn display_round_trips_through_parse() {
        for event in Event::ALL {
            assert_eq!(event.to_string().parse::<Event>().unwrap(), event);
        }
    }
}

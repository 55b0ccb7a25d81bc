use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::atomic_write_bytes;

pub const TIMESERIES_SCHEMA: &str = "timeseries_v1";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TimeseriesError {
    #[error("channel '{channel}' has {got} samples, expected {expected}")]
    LengthMismatch {
        channel: String,
        expected: usize,
        got: usize,
    },
}

/// Channel name to samples. All channels share one length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeseries {
    channels: BTreeMap<String, Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
struct TimeseriesFile {
    schema_version: String,
    length: usize,
    channels: BTreeMap<String, Vec<f64>>,
}

impl Timeseries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        samples: Vec<f64>,
    ) -> Result<(), TimeseriesError> {
        let name = name.into();
        if let Some(expected) = self.len_of_other(&name) {
            if expected != samples.len() {
                return Err(TimeseriesError::LengthMismatch {
                    channel: name,
                    expected,
                    got: samples.len(),
                });
            }
        }
        self.channels.insert(name, samples);
        Ok(())
    }

    fn len_of_other(&self, name: &str) -> Option<usize> {
        self.channels
            .iter()
            .find(|(k, _)| k.as_str() != name)
            .map(|(_, v)| v.len())
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(|v| v.as_slice())
    }

    /// First channel present among `aliases`.
    pub fn first_of(&self, aliases: &[&str]) -> Option<(&str, &[f64])> {
        aliases.iter().find_map(|alias| {
            self.channels
                .get_key_value(*alias)
                .map(|(k, v)| (k.as_str(), v.as_slice()))
        })
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|k| k.as_str())
    }

    /// Shared channel length; 0 when there are no channels.
    pub fn len(&self) -> usize {
        self.channels.values().next().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = TimeseriesFile {
            schema_version: TIMESERIES_SCHEMA.to_string(),
            length: self.len(),
            channels: self.channels.clone(),
        };
        atomic_write_bytes(path, &serde_json::to_vec(&file)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file: TimeseriesFile = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut ts = Timeseries::new();
        for (name, samples) in file.channels {
            ts.insert(name, samples)?;
        }
        Ok(ts)
    }
}

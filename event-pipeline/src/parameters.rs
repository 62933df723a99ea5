use crate::error::{ConfigError, ConfigResult};
use clap::{Args, Parser, Subcommand};
use digi_event_common::Time;
use serde::Deserialize;
use std::{fs, path::Path};

fn default_reference_detector() -> String {
    "bmon".to_owned()
}

fn default_overlap_mode() -> String {
    "NoOverlap".to_owned()
}

/// Event builder settings in their string form, see `EventBuilderConfig::from_parameters`.
#[derive(Default, Debug, Clone, Args, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BuilderParameters {
    /// Detector whose digis are clustered into triggers, e.g. `kBmon`
    #[clap(long, default_value = "bmon")]
    #[serde(default = "default_reference_detector")]
    pub(crate) reference_detector: String,

    /// One of `NoOverlap`, `MergeOverlap` or `AllowOverlap`
    #[clap(long, default_value = "NoOverlap")]
    #[serde(default = "default_overlap_mode")]
    pub(crate) overlap_mode: String,

    /// Detector to build events for, with the default window. Can be repeated.
    #[clap(long = "add-detector")]
    #[serde(default)]
    pub(crate) add_detectors: Vec<String>,

    /// Detector to drop from the event building. Can be repeated.
    #[clap(long = "remove-detector")]
    #[serde(default)]
    pub(crate) remove_detectors: Vec<String>,

    /// Window around each trigger, as `detector,winBegin,winEnd` in ns. Can be repeated.
    #[clap(long = "window")]
    #[serde(default)]
    pub(crate) windows: Vec<String>,

    /// Minimum number of digis per event, as `detector,minCount`. Can be repeated.
    #[clap(long = "min-count")]
    #[serde(default)]
    pub(crate) min_counts: Vec<String>,

    /// Maximum number of digis per event, as `detector,maxCount`, negative for no cut. Can be repeated.
    #[clap(long = "max-count")]
    #[serde(default)]
    pub(crate) max_counts: Vec<String>,

    /// Minimum number of fired layers per event, as `detector,minLayers`. Can be repeated.
    #[clap(long = "min-layers")]
    #[serde(default)]
    pub(crate) min_layers: Vec<String>,

    /// Only accept triggers in the core of the timeslice
    #[clap(long)]
    #[serde(default)]
    pub(crate) ignore_ts_overlap_region: bool,

    /// Copy the digis of detectors sharing their storage with a sibling sub-type
    #[clap(long)]
    #[serde(default)]
    pub(crate) exclusive_subtype_extraction: bool,
}

#[derive(Debug, Clone, Args, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TriggerParameters {
    /// Largest gap between digis of one cluster (ns)
    #[clap(long = "trigger-window", default_value = "10")]
    pub(crate) window: Time,

    /// Minimum number of digis in a cluster
    #[clap(long = "trigger-min-digis", default_value = "2")]
    pub(crate) min_digis: u32,

    /// Minimum time between two triggers (ns)
    #[clap(long = "trigger-dead-time", default_value = "50")]
    pub(crate) dead_time: Time,
}

#[derive(Default, Debug, Clone, Args, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SequencerParameters {
    /// Write a placeholder record for every missing timeslice
    #[clap(long)]
    #[serde(default)]
    pub(crate) write_missing_ts: bool,

    /// Hand timeslices to the sink in arrival order
    #[clap(long)]
    #[serde(default)]
    pub(crate) bypass_consecutive_ts: bool,

    /// Keep the full timeslice digis in each record
    #[clap(long)]
    #[serde(default)]
    pub(crate) store_full_ts: bool,
}

/// Everything that is fixed for the duration of a run.
#[derive(Debug, Clone, Args, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RunConfig {
    #[clap(flatten)]
    pub(crate) builder: BuilderParameters,

    #[clap(flatten)]
    pub(crate) trigger: TriggerParameters,

    #[clap(flatten)]
    #[serde(default)]
    pub(crate) sequencer: SequencerParameters,
}

impl RunConfig {
    pub(crate) fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseFile {
            path: path.to_owned(),
            source,
        })
    }
}

#[derive(Default, Debug, Clone, Parser)]
pub(crate) struct SimulationParameters {
    /// Number of timeslices to generate
    #[clap(long, default_value = "100")]
    pub(crate) timeslices: u64,

    /// Duration of the core of each timeslice (ns)
    #[clap(long, default_value = "100000")]
    pub(crate) core_duration_ns: Time,

    /// Duration of the overlap appended to each timeslice (ns)
    #[clap(long, default_value = "10000")]
    pub(crate) overlap_duration_ns: Time,

    /// Mean time between two physics clusters (ns)
    #[clap(long, default_value = "2000")]
    pub(crate) mean_cluster_interval_ns: Time,

    /// Mean number of digis per cluster and detector
    #[clap(long, default_value = "4")]
    pub(crate) mean_cluster_size: f64,

    /// Spread of digi times around their cluster (ns)
    #[clap(long, default_value = "3")]
    pub(crate) cluster_spread_ns: Time,

    /// Mean number of uncorrelated noise digis per detector and timeslice
    #[clap(long, default_value = "20")]
    pub(crate) noise_digis: f64,

    /// Number of layers digis are spread over
    #[clap(long, default_value = "4")]
    pub(crate) layers: u32,

    /// Probability that a timeslice is lost upstream and reported as missing
    #[clap(long, default_value = "0.05")]
    pub(crate) missing_probability: f64,

    /// Timeslices are shuffled within blocks of this many
    #[clap(long, default_value = "4")]
    pub(crate) shuffle_depth: usize,

    /// Time between two generated timeslices (ms)
    #[clap(long, default_value = "0")]
    pub(crate) timeslice_interval_ms: u64,

    /// Seed of the random generator, taken from the clock if not given
    #[clap(long)]
    pub(crate) seed: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Mode {
    #[clap(about = "Feeds the pipeline with randomly generated timeslices.")]
    Simulate(SimulationParameters),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_config_from_json() {
        let json = r#"{
            "builder": {
                "reference-detector": "kTof",
                "overlap-mode": "AllowOverlap",
                "windows": ["kSts,-50,100"],
                "min-counts": ["kSts,2"]
            },
            "trigger": { "window": 5.0, "min-digis": 3, "dead-time": 20.0 },
            "sequencer": { "write-missing-ts": true }
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.builder.reference_detector, "kTof");
        assert_eq!(config.builder.windows, vec!["kSts,-50,100"]);
        assert!(config.builder.max_counts.is_empty());
        assert!(!config.builder.ignore_ts_overlap_region);
        assert_eq!(config.trigger.min_digis, 3);
        assert!(config.sequencer.write_missing_ts);
        assert!(!config.sequencer.bypass_consecutive_ts);
    }

    #[test]
    fn run_config_defaults() {
        let json = r#"{ "builder": {}, "trigger": { "window": 5.0, "min-digis": 3, "dead-time": 20.0 } }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.builder.reference_detector, "bmon");
        assert_eq!(config.builder.overlap_mode, "NoOverlap");
        assert!(!config.sequencer.store_full_ts);
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            RunConfig::from_file(Path::new("/nonexistent/run.json")),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}

use crate::{
    error::{ConfigEntry, ConfigError, ConfigResult},
    parameters::BuilderParameters,
};
use digi_event_common::{DetectorId, Time};
use std::{cmp::Ordering, str::FromStr};
use strum::{Display, EnumString};
use tracing::{info, warn};

pub(crate) const DEFAULT_WIN_BEGIN: Time = -100.0;
pub(crate) const DEFAULT_WIN_END: Time = 100.0;

/// How the windows of neighbouring triggers interact when they overlap.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(ascii_case_insensitive)]
pub(crate) enum OverlapMode {
    /// A digi is assigned to at most one event.
    #[default]
    NoOverlap,
    /// Overlapping triggers are folded into one event.
    MergeOverlap,
    /// Each trigger gets its own event, digis may be shared.
    AllowOverlap,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DetectorWindowConfig {
    pub(crate) detector: DetectorId,
    /// Window relative to the trigger, `[win_begin_ns, win_end_ns)`.
    pub(crate) win_begin_ns: Time,
    pub(crate) win_end_ns: Time,
    /// Zero disables the cut.
    pub(crate) min_count: u32,
    /// `None` disables the cut, `Some(0)` requires the detector to be silent.
    pub(crate) max_count: Option<u32>,
    /// Zero disables the cut.
    pub(crate) min_layers: u32,
}

impl DetectorWindowConfig {
    pub(crate) fn new(detector: DetectorId) -> Self {
        Self {
            detector,
            win_begin_ns: DEFAULT_WIN_BEGIN,
            win_end_ns: DEFAULT_WIN_END,
            min_count: 0,
            max_count: None,
            min_layers: 0,
        }
    }

    pub(crate) fn with_window(mut self, begin: Time, end: Time) -> Self {
        self.win_begin_ns = begin;
        self.win_end_ns = end;
        self
    }

    pub(crate) fn with_min_count(mut self, min_count: u32) -> Self {
        self.min_count = min_count;
        self
    }

    pub(crate) fn with_max_count(mut self, max_count: Option<u32>) -> Self {
        self.max_count = max_count;
        self
    }

    pub(crate) fn with_min_layers(mut self, min_layers: u32) -> Self {
        self.min_layers = min_layers;
        self
    }

    pub(crate) fn width(&self) -> Time {
        self.win_end_ns - self.win_begin_ns
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EventBuilderConfig {
    pub(crate) reference_detector: DetectorId,
    pub(crate) overlap_mode: OverlapMode,
    pub(crate) detectors: Vec<DetectorWindowConfig>,
    pub(crate) ignore_ts_overlap_region: bool,
    pub(crate) exclusive_subtype_extraction: bool,
}

impl EventBuilderConfig {
    pub(crate) fn new(reference_detector: DetectorId, overlap_mode: OverlapMode) -> Self {
        Self {
            reference_detector,
            overlap_mode,
            detectors: vec![DetectorWindowConfig::new(reference_detector)],
            ignore_ts_overlap_region: false,
            exclusive_subtype_extraction: false,
        }
    }

    /// Builds the configuration from its string form.
    ///
    /// Malformed entries are logged and skipped. Only a reference detector which
    /// cannot be resolved is an error.
    pub(crate) fn from_parameters(parameters: &BuilderParameters) -> ConfigResult<Self> {
        let reference_detector = DetectorId::from_str(parameters.reference_detector.trim())
            .map_err(|_| {
                ConfigError::UnresolvedReferenceDetector(parameters.reference_detector.clone())
            })?;

        let overlap_mode = match OverlapMode::from_str(parameters.overlap_mode.trim()) {
            Ok(mode) => mode,
            Err(_) => {
                warn!(
                    "Unknown overlap mode '{}', using {}",
                    parameters.overlap_mode,
                    OverlapMode::default()
                );
                OverlapMode::default()
            }
        };

        let mut config = Self::new(reference_detector, overlap_mode);
        config.ignore_ts_overlap_region = parameters.ignore_ts_overlap_region;
        config.exclusive_subtype_extraction = parameters.exclusive_subtype_extraction;

        for input in &parameters.add_detectors {
            match parse_detector(input) {
                Ok(detector) => config.add_detector(DetectorWindowConfig::new(detector)),
                Err(e) => warn!("Skipping detector to add: {e}"),
            }
        }
        for input in &parameters.remove_detectors {
            match parse_detector(input) {
                Ok(detector) => config.remove_detector(detector),
                Err(e) => warn!("Skipping detector to remove: {e}"),
            }
        }

        for entry in &parameters.windows {
            match WindowEntry::from_str(entry) {
                Ok(WindowEntry {
                    detector,
                    begin,
                    end,
                }) => match config.detector_mut(detector) {
                    Some(existing) => {
                        existing.win_begin_ns = begin;
                        existing.win_end_ns = end;
                    }
                    None => config
                        .detectors
                        .push(DetectorWindowConfig::new(detector).with_window(begin, end)),
                },
                Err(e) => warn!("Skipping {}: {e}", ConfigEntry::Window),
            }
        }

        config.apply_counts(ConfigEntry::MinCount, &parameters.min_counts, |det, value| {
            det.with_min_count(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
        });
        config.apply_counts(ConfigEntry::MaxCount, &parameters.max_counts, |det, value| {
            det.with_max_count(u32::try_from(value).ok())
        });
        config.apply_counts(ConfigEntry::MinLayers, &parameters.min_layers, |det, value| {
            det.with_min_layers(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
        });

        info!(
            "Event builder: reference {}, mode {}, {} detectors",
            config.reference_detector,
            config.overlap_mode,
            config.detectors.len()
        );
        Ok(config)
    }

    fn apply_counts<F>(&mut self, entry: ConfigEntry, entries: &[String], apply: F)
    where
        F: Fn(DetectorWindowConfig, i64) -> DetectorWindowConfig,
    {
        for input in entries {
            match CountEntry::parse(entry, input) {
                Ok(CountEntry { detector, value }) => match self.detector_mut(detector) {
                    Some(det) => *det = apply(det.clone(), value),
                    None => warn!("Skipping {entry} for unconfigured detector {detector}"),
                },
                Err(e) => warn!("Skipping {entry}: {e}"),
            }
        }
    }

    pub(crate) fn detector(&self, detector: DetectorId) -> Option<&DetectorWindowConfig> {
        self.detectors.iter().find(|det| det.detector == detector)
    }

    fn detector_mut(&mut self, detector: DetectorId) -> Option<&mut DetectorWindowConfig> {
        self.detectors.iter_mut().find(|det| det.detector == detector)
    }

    /// Adds a detector, replacing any existing configuration for it.
    pub(crate) fn add_detector(&mut self, config: DetectorWindowConfig) {
        match self.detector_mut(config.detector) {
            Some(existing) => {
                warn!("Detector {} already configured, replacing it", config.detector);
                *existing = config;
            }
            None => self.detectors.push(config),
        }
    }

    pub(crate) fn remove_detector(&mut self, detector: DetectorId) {
        if detector == self.reference_detector {
            warn!("Cannot remove reference detector {detector}");
            return;
        }
        let before = self.detectors.len();
        self.detectors.retain(|det| det.detector != detector);
        if self.detectors.len() == before {
            warn!("Cannot remove detector {detector}, it is not configured");
        }
    }

    pub(crate) fn earliest_begin(&self) -> Time {
        self.detectors
            .iter()
            .map(|det| det.win_begin_ns)
            .fold(Time::INFINITY, Time::min)
    }

    pub(crate) fn latest_end(&self) -> Time {
        self.detectors
            .iter()
            .map(|det| det.win_end_ns)
            .fold(Time::NEG_INFINITY, Time::max)
    }

    pub(crate) fn widest_range(&self) -> Time {
        self.detectors
            .iter()
            .map(DetectorWindowConfig::width)
            .fold(0.0, Time::max)
    }
}

fn parse_detector(input: &str) -> ConfigResult<DetectorId> {
    DetectorId::from_str(input.trim()).map_err(|_| ConfigError::UnknownDetector(input.to_owned()))
}

/// `detector,winBegin,winEnd`
#[derive(Debug, PartialEq)]
pub(crate) struct WindowEntry {
    pub(crate) detector: DetectorId,
    pub(crate) begin: Time,
    pub(crate) end: Time,
}

impl FromStr for WindowEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vals: Vec<_> = s.split(',').collect();
        let [detector, begin, end] = vals.as_slice() else {
            return Err(ConfigError::FieldCount {
                entry: ConfigEntry::Window,
                expected: 3,
                input: s.to_owned(),
            });
        };
        let parse = |val: &str| {
            Time::from_str(val.trim()).map_err(|source| ConfigError::InvalidFloat {
                entry: ConfigEntry::Window,
                input: s.to_owned(),
                source,
            })
        };
        let detector = parse_detector(detector)?;
        let begin = parse(*begin)?;
        let end = parse(*end)?;
        if begin.partial_cmp(&end) != Some(Ordering::Less) {
            return Err(ConfigError::EmptyWindow {
                begin,
                end,
                input: s.to_owned(),
            });
        }
        Ok(Self {
            detector,
            begin,
            end,
        })
    }
}

/// `detector,value`
#[derive(Debug, PartialEq)]
pub(crate) struct CountEntry {
    pub(crate) detector: DetectorId,
    pub(crate) value: i64,
}

impl CountEntry {
    pub(crate) fn parse(entry: ConfigEntry, s: &str) -> ConfigResult<Self> {
        let vals: Vec<_> = s.split(',').collect();
        let [detector, value] = vals.as_slice() else {
            return Err(ConfigError::FieldCount {
                entry,
                expected: 2,
                input: s.to_owned(),
            });
        };
        let detector = parse_detector(detector)?;
        let value = i64::from_str(value.trim()).map_err(|source| ConfigError::InvalidInteger {
            entry,
            input: s.to_owned(),
            source,
        })?;
        Ok(Self { detector, value })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parameters() -> BuilderParameters {
        BuilderParameters {
            reference_detector: "kBmon".to_owned(),
            overlap_mode: "MergeOverlap".to_owned(),
            windows: vec![
                "kSts,-50,100".to_owned(),
                "kTof,-20,40".to_owned(),
                "kBmon,-10,10".to_owned(),
            ],
            min_counts: vec!["kSts,3".to_owned()],
            max_counts: vec!["kTof,-1".to_owned(), "kBmon,0".to_owned()],
            min_layers: vec!["kSts,2".to_owned()],
            ignore_ts_overlap_region: true,
            exclusive_subtype_extraction: false,
            ..Default::default()
        }
    }

    #[test]
    fn window_entry() {
        assert_eq!(
            WindowEntry::from_str("kSts,-50,100").ok(),
            Some(WindowEntry {
                detector: DetectorId::Sts,
                begin: -50.0,
                end: 100.0
            })
        );
        assert!(matches!(
            WindowEntry::from_str("kSts,-50"),
            Err(ConfigError::FieldCount { expected: 3, .. })
        ));
        assert!(matches!(
            WindowEntry::from_str("kFoo,-50,10"),
            Err(ConfigError::UnknownDetector(_))
        ));
        assert!(matches!(
            WindowEntry::from_str("kSts,abc,10"),
            Err(ConfigError::InvalidFloat { .. })
        ));
        assert!(matches!(
            WindowEntry::from_str("kSts,10,10"),
            Err(ConfigError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn count_entry() {
        assert_eq!(
            CountEntry::parse(ConfigEntry::MinCount, "sts, 4").ok(),
            Some(CountEntry {
                detector: DetectorId::Sts,
                value: 4
            })
        );
        assert!(matches!(
            CountEntry::parse(ConfigEntry::MinCount, "sts,4,5"),
            Err(ConfigError::FieldCount { expected: 2, .. })
        ));
        assert!(matches!(
            CountEntry::parse(ConfigEntry::MaxCount, "sts,x"),
            Err(ConfigError::InvalidInteger { .. })
        ));
    }

    #[test]
    fn from_parameters() {
        let config = EventBuilderConfig::from_parameters(&parameters()).unwrap();

        assert_eq!(config.reference_detector, DetectorId::Bmon);
        assert_eq!(config.overlap_mode, OverlapMode::MergeOverlap);
        assert!(config.ignore_ts_overlap_region);
        assert_eq!(config.detectors.len(), 3);

        let bmon = config.detector(DetectorId::Bmon).unwrap();
        assert_eq!((bmon.win_begin_ns, bmon.win_end_ns), (-10.0, 10.0));
        assert_eq!(bmon.max_count, Some(0));

        let sts = config.detector(DetectorId::Sts).unwrap();
        assert_eq!(sts.min_count, 3);
        assert_eq!(sts.min_layers, 2);
        assert_eq!(sts.max_count, None);

        let tof = config.detector(DetectorId::Tof).unwrap();
        assert_eq!(tof.max_count, None);
    }

    #[test]
    fn bad_entries_are_skipped() {
        let mut parameters = parameters();
        parameters.windows.push("kCalo,-1,1".to_owned());
        parameters.windows.push("kRich,1".to_owned());
        parameters.min_counts.push("kMuch,2".to_owned());
        parameters.overlap_mode = "SometimesOverlap".to_owned();

        let config = EventBuilderConfig::from_parameters(&parameters).unwrap();
        assert_eq!(config.detectors.len(), 3);
        assert!(config.detector(DetectorId::Rich).is_none());
        assert!(config.detector(DetectorId::Much).is_none());
        assert_eq!(config.overlap_mode, OverlapMode::NoOverlap);
    }

    #[test]
    fn unresolved_reference_is_fatal() {
        let mut parameters = parameters();
        parameters.reference_detector = "kCalo".to_owned();
        assert!(matches!(
            EventBuilderConfig::from_parameters(&parameters),
            Err(ConfigError::UnresolvedReferenceDetector(_))
        ));
    }

    #[test]
    fn reference_gets_default_window() {
        let mut parameters = parameters();
        parameters.windows.clear();
        parameters.max_counts.clear();
        let config = EventBuilderConfig::from_parameters(&parameters).unwrap();
        let bmon = config.detector(DetectorId::Bmon).unwrap();
        assert_eq!(
            (bmon.win_begin_ns, bmon.win_end_ns),
            (DEFAULT_WIN_BEGIN, DEFAULT_WIN_END)
        );
    }

    #[test]
    fn add_and_remove_detectors() {
        let mut config = EventBuilderConfig::new(DetectorId::Tof, OverlapMode::AllowOverlap);
        config.add_detector(DetectorWindowConfig::new(DetectorId::Sts).with_window(-5.0, 5.0));
        config.add_detector(DetectorWindowConfig::new(DetectorId::Sts).with_window(-7.0, 3.0));
        assert_eq!(config.detectors.len(), 2);
        assert_eq!(config.detector(DetectorId::Sts).unwrap().win_begin_ns, -7.0);

        config.remove_detector(DetectorId::Tof);
        assert!(config.detector(DetectorId::Tof).is_some());

        config.remove_detector(DetectorId::Sts);
        config.remove_detector(DetectorId::Rich);
        assert_eq!(config.detectors.len(), 1);
    }

    #[test]
    fn detector_lists_from_parameters() {
        let mut parameters = parameters();
        parameters.add_detectors = vec!["kRich".to_owned(), "kCalo".to_owned()];
        parameters.remove_detectors = vec!["kTof".to_owned(), "kBmon".to_owned()];
        parameters.min_counts.push("kRich,1".to_owned());

        let config = EventBuilderConfig::from_parameters(&parameters).unwrap();
        let detectors: Vec<_> = config.detectors.iter().map(|det| det.detector).collect();
        assert_eq!(
            detectors,
            vec![DetectorId::Bmon, DetectorId::Rich, DetectorId::Sts, DetectorId::Tof]
        );
        assert_eq!(config.detector(DetectorId::Rich).unwrap().min_count, 1);
    }

    #[test]
    fn window_extents() {
        let mut config = EventBuilderConfig::new(DetectorId::Tof, OverlapMode::NoOverlap);
        config.add_detector(DetectorWindowConfig::new(DetectorId::Tof).with_window(-20.0, 40.0));
        config.add_detector(DetectorWindowConfig::new(DetectorId::Sts).with_window(-50.0, 0.0));
        assert_eq!(config.earliest_begin(), -50.0);
        assert_eq!(config.latest_end(), 40.0);
        assert_eq!(config.widest_range(), 60.0);
    }

    #[test]
    fn overlap_mode_names() {
        assert_eq!(OverlapMode::from_str("NoOverlap"), Ok(OverlapMode::NoOverlap));
        assert_eq!(OverlapMode::from_str("mergeoverlap"), Ok(OverlapMode::MergeOverlap));
        assert_eq!(OverlapMode::AllowOverlap.to_string(), "AllowOverlap");
    }
}

use super::config::DetectorWindowConfig;
use digi_event_common::{DetectorId, Digi};
use itertools::Itertools;
use thiserror::Error;

/// Why an event did not pass the quality gate of one detector.
#[derive(Debug, Error, PartialEq)]
pub(crate) enum Rejection {
    #[error("{detector} has {count} digis, at least {min} required")]
    TooFewDigis {
        detector: DetectorId,
        count: usize,
        min: u32,
    },
    #[error("{detector} has {count} digis, at most {max} allowed")]
    TooManyDigis {
        detector: DetectorId,
        count: usize,
        max: u32,
    },
    #[error("{detector} has {count} fired layers, at least {min} required")]
    TooFewLayers {
        detector: DetectorId,
        count: usize,
        min: u32,
    },
}

impl Rejection {
    pub(crate) fn label(&self) -> (&'static str, &'static str) {
        (
            "reason",
            match self {
                Rejection::TooFewDigis { .. } => "too_few_digis",
                Rejection::TooManyDigis { .. } => "too_many_digis",
                Rejection::TooFewLayers { .. } => "too_few_layers",
            },
        )
    }
}

/// Checks the digis a detector contributes to an event against its cuts.
///
/// Only digis belonging to the configured detector are counted, so sibling
/// sub-types found in a shared block are ignored.
pub(crate) fn check(config: &DetectorWindowConfig, digis: &[Digi]) -> Result<(), Rejection> {
    let detector = config.detector;
    if config.min_count == 0 && config.max_count.is_none() && config.min_layers == 0 {
        return Ok(());
    }

    let count = own_digis(detector, digis).count();

    if config.min_count > 0 && count < config.min_count as usize {
        return Err(Rejection::TooFewDigis {
            detector,
            count,
            min: config.min_count,
        });
    }
    if let Some(max) = config.max_count {
        if count > max as usize {
            return Err(Rejection::TooManyDigis {
                detector,
                count,
                max,
            });
        }
    }
    if config.min_layers > 0 {
        let layers = own_digis(detector, digis)
            .map(Digi::layer)
            .unique()
            .count();
        if layers < config.min_layers as usize {
            return Err(Rejection::TooFewLayers {
                detector,
                count: layers,
                min: config.min_layers,
            });
        }
    }
    Ok(())
}

fn own_digis(detector: DetectorId, digis: &[Digi]) -> impl Iterator<Item = &Digi> {
    digis.iter().filter(move |digi| detector.accepts(digi))
}

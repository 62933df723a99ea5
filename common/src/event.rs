use crate::{DetectorId, Digi, DigiTimeslice, EventNumber, Time, TimesliceIndex};
use std::{collections::BTreeMap, ops::Range};

/// The digis a detector contributes to an event.
#[derive(Clone, Debug, PartialEq)]
pub enum Slice {
    /// Indices into the detector's storage array of the parent timeslice.
    Range(Range<usize>),
    /// Digis copied out of the parent timeslice.
    Owned(Vec<Digi>),
}

impl Slice {
    pub fn len(&self) -> usize {
        match self {
            Slice::Range(range) => range.len(),
            Slice::Owned(digis) => digis.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the slice against the storage array it was built from.
    pub fn resolve<'a>(&'a self, storage: &'a [Digi]) -> &'a [Digi] {
        match self {
            Slice::Range(range) => storage.get(range.clone()).unwrap_or_default(),
            Slice::Owned(digis) => digis,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DigiEvent {
    pub time: Time,
    pub number: EventNumber,
    pub timeslice_index: TimesliceIndex,
    pub per_detector: BTreeMap<DetectorId, Slice>,
}

impl DigiEvent {
    pub fn new(time: Time, number: EventNumber, timeslice_index: TimesliceIndex) -> Self {
        Self {
            time,
            number,
            timeslice_index,
            per_detector: Default::default(),
        }
    }

    /// The digis of a detector in this event, or an empty slice if it has none.
    pub fn digis<'a>(&'a self, detector: DetectorId, timeslice: &'a DigiTimeslice) -> &'a [Digi] {
        self.per_detector
            .get(&detector)
            .map(|slice| slice.resolve(timeslice.digis(detector)))
            .unwrap_or_default()
    }

    pub fn num_digis(&self) -> usize {
        self.per_detector.values().map(Slice::len).sum()
    }

    /// Copies every range slice out of the parent timeslice, so the event no longer depends on it.
    pub fn into_owned(mut self, timeslice: &DigiTimeslice) -> Self {
        for (detector, slice) in self.per_detector.iter_mut() {
            if let Slice::Range(range) = slice {
                let digis = timeslice
                    .digis(*detector)
                    .get(range.clone())
                    .unwrap_or_default()
                    .to_vec();
                *slice = Slice::Owned(digis);
            }
        }
        self
    }
}

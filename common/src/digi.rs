use crate::{ChannelAddress, DetectorId, Time, TimesliceIndex};
use std::collections::BTreeMap;

/// A single time-stamped measurement of one detector channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Digi {
    pub time: Time,
    pub channel_address: ChannelAddress,
    pub payload: u64,
}

impl Digi {
    pub fn new(time: Time, channel_address: ChannelAddress, payload: u64) -> Self {
        Self {
            time,
            channel_address,
            payload,
        }
    }
}

/// Timing information of a timeslice, without its digis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimesliceMeta {
    pub index: TimesliceIndex,
    pub start_time_ns: Time,
    pub core_duration_ns: Time,
    pub overlap_duration_ns: Time,
}

impl TimesliceMeta {
    /// Metadata written in place of a timeslice that never arrived.
    pub fn placeholder(index: TimesliceIndex) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn core_end(&self) -> Time {
        self.start_time_ns + self.core_duration_ns
    }
}

/// One fixed-duration chunk of unpacked data.
///
/// Each digi vector is sorted by ascending time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DigiTimeslice {
    pub meta: TimesliceMeta,
    pub per_detector: BTreeMap<DetectorId, Vec<Digi>>,
}

impl DigiTimeslice {
    pub fn new(meta: TimesliceMeta) -> Self {
        Self {
            meta,
            per_detector: Default::default(),
        }
    }

    pub fn index(&self) -> TimesliceIndex {
        self.meta.index
    }

    /// Inserts the digis of one detector, sorting them by time.
    pub fn insert(&mut self, detector: DetectorId, mut digis: Vec<Digi>) {
        digis.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.per_detector.insert(detector.storage(), digis);
    }

    /// The digi array a detector reads from, empty if the detector did not deliver data.
    pub fn digis(&self, detector: DetectorId) -> &[Digi] {
        self.per_detector
            .get(&detector.storage())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_detector(&self, detector: DetectorId) -> bool {
        self.per_detector.contains_key(&detector.storage())
    }

    pub fn num_digis(&self) -> usize {
        self.per_detector.values().map(Vec::len).sum()
    }
}

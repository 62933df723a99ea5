use super::config::EventBuilderConfig;
use digi_event_common::{Digi, Time, TimesliceMeta};
use std::ops::Range;

/// Index range of the digis whose time lies in `[begin, end)`.
///
/// `digis` must be sorted by time.
pub(crate) fn window_range(digis: &[Digi], begin: Time, end: Time) -> Range<usize> {
    let lo = digis.partition_point(|digi| digi.time < begin);
    let hi = digis.partition_point(|digi| digi.time < end);
    lo..hi.max(lo)
}

/// Narrows `range` to span only the digis `accept` keeps, from the first to the last.
pub(crate) fn narrow_range<F>(digis: &[Digi], range: Range<usize>, accept: F) -> Range<usize>
where
    F: Fn(&Digi) -> bool,
{
    let Some(window) = digis.get(range.clone()) else {
        return range.start..range.start;
    };
    match (
        window.iter().position(&accept),
        window.iter().rposition(&accept),
    ) {
        (Some(first), Some(last)) => (range.start + first)..(range.start + last + 1),
        _ => range.start..range.start,
    }
}

/// Triggers outside this window are not used to build events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SeedWindow {
    pub(crate) begin: Time,
    pub(crate) end: Time,
}

impl SeedWindow {
    pub(crate) fn new(meta: &TimesliceMeta, config: &EventBuilderConfig) -> Self {
        if config.ignore_ts_overlap_region {
            Self {
                begin: meta.start_time_ns,
                end: meta.core_end(),
            }
        } else {
            let earliest = config.earliest_begin();
            let shift = if 0.0 < earliest { 0.0 } else { -earliest };
            Self {
                begin: meta.start_time_ns + shift,
                end: meta.core_end() + shift,
            }
        }
    }

    pub(crate) fn contains(&self, time: Time) -> bool {
        self.begin <= time && time <= self.end
    }
}

/// False if an event seeded at the end of the core could reach past the overlap.
pub(crate) fn windows_fit_overlap(meta: &TimesliceMeta, config: &EventBuilderConfig) -> bool {
    let overlap = meta.overlap_duration_ns;
    let earliest = config.earliest_begin();
    !((0.0 < earliest && overlap < config.latest_end()) || overlap < config.widest_range())
}

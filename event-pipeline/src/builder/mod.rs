mod config;
mod gate;
mod window;

pub(crate) use config::{EventBuilderConfig, OverlapMode};
#[cfg(test)]
pub(crate) use config::DetectorWindowConfig;

use digi_event_common::{
    DetectorId, Digi, DigiEvent, DigiTimeslice, EventNumber, Slice, Time, TimesliceIndex,
    metrics::names::{EVENTS_BUILT, EVENTS_REJECTED},
};
use metrics::counter;
use std::{borrow::Cow, collections::BTreeMap, ops::Range};
use tracing::{debug, trace, warn};
use window::{SeedWindow, narrow_range, window_range, windows_fit_overlap};

/// An event whose windows are known but which has not been checked or emitted yet.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    time: Time,
    /// Latest trigger folded into this candidate.
    last_trigger: Time,
    /// Per configured detector, in configuration order, the disjoint non-empty index
    /// ranges covered by the windows of the folded triggers, in ascending order.
    pieces: Vec<Vec<Range<usize>>>,
}

impl Candidate {
    fn new(trigger: Time, ranges: Vec<Range<usize>>) -> Self {
        let mut pieces = vec![Vec::new(); ranges.len()];
        for (detector_pieces, range) in pieces.iter_mut().zip(ranges) {
            add_piece(detector_pieces, range);
        }
        Self {
            time: trigger,
            last_trigger: trigger,
            pieces,
        }
    }

    fn overlaps(&self, trigger: Time, config: &EventBuilderConfig) -> bool {
        config
            .detectors
            .iter()
            .any(|det| trigger + det.win_begin_ns < self.last_trigger + det.win_end_ns)
    }

    fn merge(&mut self, trigger: Time, ranges: Vec<Range<usize>>) {
        self.last_trigger = trigger;
        for (detector_pieces, range) in self.pieces.iter_mut().zip(ranges) {
            add_piece(detector_pieces, range);
        }
    }
}

/// Adds `range` to the pieces of one detector, joining it to the last piece if they
/// overlap or touch.
fn add_piece(pieces: &mut Vec<Range<usize>>, range: Range<usize>) {
    if range.start >= range.end {
        return;
    }
    match pieces.last_mut() {
        Some(last) if range.start <= last.end && last.start <= range.end => {
            *last = last.start.min(range.start)..last.end.max(range.end);
        }
        _ => {
            pieces.push(range);
            pieces.sort_by_key(|piece| piece.start);
        }
    }
}

/// The digis of a detector covered by its pieces, borrowed when they are contiguous.
fn gather<'a>(digis: &'a [Digi], pieces: &[Range<usize>]) -> Cow<'a, [Digi]> {
    match pieces {
        [] => Cow::Borrowed(&[]),
        [piece] => Cow::Borrowed(digis.get(piece.clone()).unwrap_or_default()),
        _ => Cow::Owned(
            pieces
                .iter()
                .flat_map(|piece| digis.get(piece.clone()).unwrap_or_default())
                .copied()
                .collect(),
        ),
    }
}

/// Event building state carried between calls.
#[derive(Default, Debug)]
pub(crate) struct BuilderState {
    timeslice: Option<TimesliceIndex>,
    /// Per detector, the first digi index not yet consumed by an emitted event.
    next_free: BTreeMap<DetectorId, usize>,
    /// Event being merged in `MergeOverlap` mode.
    open: Option<Candidate>,
    next_number: EventNumber,
    overlap_checked: bool,
}

impl BuilderState {
    fn enter(&mut self, timeslice: &DigiTimeslice, config: &EventBuilderConfig) {
        if self.timeslice == Some(timeslice.index()) {
            return;
        }
        if let Some(open) = self.open.take() {
            warn!(
                "Dropping open event at {} from timeslice {:?}",
                open.time, self.timeslice
            );
        }
        self.next_free.clear();
        self.timeslice = Some(timeslice.index());

        if !self.overlap_checked {
            self.overlap_checked = true;
            if !windows_fit_overlap(&timeslice.meta, config) {
                warn!(
                    "Event window not fitting in timeslice overlap, risk of incomplete events: \
                    earliest {}, latest {}, widest {}, overlap {}",
                    config.earliest_begin(),
                    config.latest_end(),
                    config.widest_range(),
                    timeslice.meta.overlap_duration_ns
                );
            }
        }
    }

    pub(crate) fn events_emitted(&self) -> EventNumber {
        self.next_number
    }
}

/// Builds events for a batch of triggers of one timeslice.
///
/// In `MergeOverlap` mode the last event stays open, so that triggers of a
/// later batch for the same timeslice can still be merged into it. Use
/// [flush] to close it.
#[tracing::instrument(skip_all, level = "trace", fields(index = timeslice.index(), triggers = triggers.len()))]
pub(crate) fn extend(
    timeslice: &DigiTimeslice,
    triggers: &[Time],
    config: &EventBuilderConfig,
    state: &mut BuilderState,
) -> Vec<DigiEvent> {
    state.enter(timeslice, config);
    let seed_window = SeedWindow::new(&timeslice.meta, config);

    let mut events = Vec::new();
    for &trigger in triggers {
        if !seed_window.contains(trigger) {
            trace!("Trigger {trigger} outside seed window {seed_window:?}");
            continue;
        }
        let ranges = trigger_ranges(timeslice, trigger, config, state);
        match config.overlap_mode {
            OverlapMode::NoOverlap | OverlapMode::AllowOverlap => {
                let candidate = Candidate::new(trigger, ranges);
                events.extend(close(timeslice, candidate, config, state));
            }
            OverlapMode::MergeOverlap => match state.open.take() {
                Some(mut open) if open.overlaps(trigger, config) => {
                    trace!("Merging trigger {trigger} into event at {}", open.time);
                    open.merge(trigger, ranges);
                    state.open = Some(open);
                }
                previous => {
                    if let Some(previous) = previous {
                        events.extend(close(timeslice, previous, config, state));
                    }
                    state.open = Some(Candidate::new(trigger, ranges));
                }
            },
        }
    }
    events
}

/// Closes the event left open by [extend], if any.
pub(crate) fn flush(
    timeslice: &DigiTimeslice,
    config: &EventBuilderConfig,
    state: &mut BuilderState,
) -> Option<DigiEvent> {
    if state.timeslice != Some(timeslice.index()) {
        return None;
    }
    let open = state.open.take()?;
    close(timeslice, open, config, state)
}

/// Builds all events of a timeslice.
pub(crate) fn build(
    timeslice: &DigiTimeslice,
    triggers: &[Time],
    config: &EventBuilderConfig,
    state: &mut BuilderState,
) -> Vec<DigiEvent> {
    let mut events = extend(timeslice, triggers, config, state);
    events.extend(flush(timeslice, config, state));
    events
}

fn trigger_ranges(
    timeslice: &DigiTimeslice,
    trigger: Time,
    config: &EventBuilderConfig,
    state: &BuilderState,
) -> Vec<Range<usize>> {
    config
        .detectors
        .iter()
        .map(|det| {
            let digis = timeslice.digis(det.detector);
            let range = window_range(
                digis,
                trigger + det.win_begin_ns,
                trigger + det.win_end_ns,
            );
            match config.overlap_mode {
                OverlapMode::AllowOverlap => range,
                OverlapMode::NoOverlap | OverlapMode::MergeOverlap => {
                    let next_free = state.next_free.get(&det.detector).copied().unwrap_or(0);
                    let start = range.start.max(next_free);
                    start..range.end.max(start)
                }
            }
        })
        .collect()
}

/// Applies the quality gates and, if they pass, turns the candidate into an event.
fn close(
    timeslice: &DigiTimeslice,
    candidate: Candidate,
    config: &EventBuilderConfig,
    state: &mut BuilderState,
) -> Option<DigiEvent> {
    for (det, pieces) in config.detectors.iter().zip(&candidate.pieces) {
        let digis = gather(timeslice.digis(det.detector), pieces);
        if let Err(rejection) = gate::check(det, &digis) {
            debug!("Reject event at {}: {rejection}", candidate.time);
            counter!(EVENTS_REJECTED, &[rejection.label()]).increment(1);
            return None;
        }
    }

    if config.overlap_mode != OverlapMode::AllowOverlap {
        for (det, pieces) in config.detectors.iter().zip(&candidate.pieces) {
            if let Some(last) = pieces.last() {
                let next_free = state.next_free.entry(det.detector).or_default();
                *next_free = (*next_free).max(last.end);
            }
        }
    }

    let mut event = DigiEvent::new(candidate.time, state.next_number, timeslice.index());
    state.next_number += 1;

    for (det, pieces) in config.detectors.iter().zip(candidate.pieces) {
        let detector = det.detector;
        let digis = timeslice.digis(detector);
        let slice = if detector.has_siblings() && config.exclusive_subtype_extraction {
            Slice::Owned(
                gather(digis, &pieces)
                    .iter()
                    .filter(|digi| detector.accepts(digi))
                    .copied()
                    .collect(),
            )
        } else {
            let pieces: Vec<Range<usize>> = if detector.has_siblings() {
                pieces
                    .into_iter()
                    .map(|piece| narrow_range(digis, piece, |digi| detector.accepts(digi)))
                    .filter(|piece| piece.start < piece.end)
                    .collect()
            } else {
                pieces
            };
            match pieces.as_slice() {
                [] => Slice::Range(0..0),
                [piece] => Slice::Range(piece.clone()),
                // Windows of merged triggers which do not touch.
                _ => Slice::Owned(gather(digis, &pieces).into_owned()),
            }
        };
        event.per_detector.insert(detector, slice);
    }

    counter!(EVENTS_BUILT).increment(1);
    Some(event)
}

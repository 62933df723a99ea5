//! Reorders built timeslices and missing-index reports into a strictly ascending stream.
mod control;
mod sink;

pub(crate) use control::ControlCommand;
pub(crate) use sink::{BuiltTimeslice, EventNumbering, LoggingSink, Record, Sink};

use crate::error::SinkResult;
use digi_event_common::{
    TimesliceIndex, TimesliceMeta,
    metrics::{
        failures::{self, FailureKind},
        names::{
            BUFFERED_FULL, BUFFERED_MISSING, FAILURES, GAPS_SKIPPED, NEXT_EXPECTED_INDEX,
            TIMESLICES_RESOLVED,
        },
        timeslices_resolved::{self, ResolutionKind},
    },
};
use metrics::{counter, gauge};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SequencerInput<T> {
    FullTimeslice { index: TimesliceIndex, payload: T },
    MissingIndices(Vec<TimesliceIndex>),
    Eof {
        last_index: TimesliceIndex,
        total_count: u64,
    },
    Stop,
}

impl<T> From<ControlCommand> for SequencerInput<T> {
    fn from(command: ControlCommand) -> Self {
        match command {
            ControlCommand::Eof {
                last_index,
                total_count,
            } => SequencerInput::Eof {
                last_index,
                total_count,
            },
            ControlCommand::Stop => SequencerInput::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub(crate) enum SequencerState {
    Streaming,
    Draining,
    Finalized,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SequencerOptions {
    /// Hand a placeholder record to the sink for every missing index.
    pub(crate) write_missing_ts: bool,
    /// Write full timeslices in arrival order.
    pub(crate) bypass_consecutive_ts: bool,
    /// Declare the next expected index missing after this long without progress.
    pub(crate) gap_timeout: Option<Duration>,
}

/// Summary handed to the sink when the stream is finalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SequencerReport {
    pub(crate) full_count: u64,
    pub(crate) missing_count: u64,
    /// Full timeslices still waiting for a gap to close.
    pub(crate) buffered_full: usize,
    pub(crate) buffered_missing: usize,
    /// Finalized by `Stop` rather than by a complete stream.
    pub(crate) forced: bool,
}

impl Display for SequencerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} full, {} missing, {} full and {} missing left unresolved{}",
            self.full_count,
            self.missing_count,
            self.buffered_full,
            self.buffered_missing,
            if self.forced { ", forced" } else { "" }
        )
    }
}

pub(crate) struct TimesliceSequencer<T> {
    options: SequencerOptions,
    state: SequencerState,

    next_expected_index: TimesliceIndex,
    buffered_full: BTreeMap<TimesliceIndex, T>,
    buffered_missing: BTreeSet<TimesliceIndex>,

    received_eof: bool,
    last_index: TimesliceIndex,
    total_count: u64,

    processed_count: u64,
    full_count: u64,
    missing_count: u64,
    last_progress: Instant,
}

impl<T> TimesliceSequencer<T> {
    pub(crate) fn new(options: SequencerOptions) -> Self {
        Self {
            options,
            state: SequencerState::Streaming,
            next_expected_index: 0,
            buffered_full: Default::default(),
            buffered_missing: Default::default(),
            received_eof: false,
            last_index: 0,
            total_count: 0,
            processed_count: 0,
            full_count: 0,
            missing_count: 0,
            last_progress: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> SequencerState {
        self.state
    }

    pub(crate) fn next_expected_index(&self) -> TimesliceIndex {
        self.next_expected_index
    }

    pub(crate) fn processed_count(&self) -> u64 {
        self.processed_count
    }

    pub(crate) fn buffered_full_len(&self) -> usize {
        self.buffered_full.len()
    }

    pub(crate) fn buffered_missing_len(&self) -> usize {
        self.buffered_missing.len()
    }

    pub(crate) fn update_gauges(&self) {
        gauge!(BUFFERED_FULL).set(self.buffered_full.len() as f64);
        gauge!(BUFFERED_MISSING).set(self.buffered_missing.len() as f64);
        gauge!(NEXT_EXPECTED_INDEX).set(self.next_expected_index as f64);
    }

    /// Applies one input and returns the resulting state.
    #[tracing::instrument(skip_all, level = "trace", fields(next_expected_index = self.next_expected_index))]
    pub(crate) fn handle<S: Sink<T>>(
        &mut self,
        input: SequencerInput<T>,
        sink: &mut S,
    ) -> SinkResult<SequencerState> {
        if self.state == SequencerState::Finalized {
            warn!("Input received after the stream was finalized, ignoring");
            return Ok(self.state);
        }

        match input {
            SequencerInput::FullTimeslice { index, payload } => {
                self.push_full(index, payload, sink)?;
            }
            SequencerInput::MissingIndices(indices) => {
                self.push_missing(indices, sink)?;
            }
            SequencerInput::Eof {
                last_index,
                total_count,
            } => {
                info!("End of stream: last index {last_index}, {total_count} timeslices in total");
                self.received_eof = true;
                self.last_index = last_index;
                self.total_count = total_count;
                self.state = SequencerState::Draining;
                if !self.options.bypass_consecutive_ts {
                    self.drain(sink)?;
                }
            }
            SequencerInput::Stop => {
                info!("Stop received, finalizing");
                self.finalize(true, sink)?;
                return Ok(self.state);
            }
        }

        if self.is_complete() {
            self.finalize(false, sink)?;
        }
        Ok(self.state)
    }

    /// Skips the gap at `next_expected_index` if no progress was made within the gap timeout.
    pub(crate) fn poll<S: Sink<T>>(
        &mut self,
        now: Instant,
        sink: &mut S,
    ) -> SinkResult<SequencerState> {
        let Some(timeout) = self.options.gap_timeout else {
            return Ok(self.state);
        };
        if self.state == SequencerState::Finalized || self.options.bypass_consecutive_ts {
            return Ok(self.state);
        }
        if self.buffered_full.is_empty() && self.buffered_missing.is_empty() && !self.received_eof {
            return Ok(self.state);
        }
        if self.received_eof && self.next_expected_index > self.last_index {
            return Ok(self.state);
        }
        if now.saturating_duration_since(self.last_progress) < timeout {
            return Ok(self.state);
        }

        warn!(
            "No progress for {timeout:?}, declaring timeslice {} missing",
            self.next_expected_index
        );
        counter!(GAPS_SKIPPED).increment(1);
        self.buffered_missing.insert(self.next_expected_index);
        self.drain(sink)?;
        self.last_progress = now;

        if self.is_complete() {
            self.finalize(false, sink)?;
        }
        Ok(self.state)
    }

    fn push_full<S: Sink<T>>(
        &mut self,
        index: TimesliceIndex,
        payload: T,
        sink: &mut S,
    ) -> SinkResult<()> {
        if self.options.bypass_consecutive_ts {
            self.deliver_full(index, payload, sink)?;
            return Ok(());
        }

        if index < self.next_expected_index || self.buffered_full.contains_key(&index) {
            warn!(
                "Duplicate timeslice {index} (next expected {}), dropping",
                self.next_expected_index
            );
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::DuplicateTimeslice)]
            )
            .increment(1);
            return Ok(());
        }

        if index == self.next_expected_index {
            self.deliver_full(index, payload, sink)?;
        } else {
            debug!("Buffering timeslice {index}");
            self.buffered_full.insert(index, payload);
        }
        self.drain(sink)
    }

    fn push_missing<S: Sink<T>>(
        &mut self,
        indices: Vec<TimesliceIndex>,
        sink: &mut S,
    ) -> SinkResult<()> {
        if self.options.bypass_consecutive_ts {
            for index in indices {
                if self.buffered_missing.insert(index) {
                    self.resolve_missing();
                }
            }
            return Ok(());
        }

        for index in indices {
            if index < self.next_expected_index {
                debug!("Stale missing index {index}, ignoring");
            } else {
                self.buffered_missing.insert(index);
            }
        }
        self.drain(sink)
    }

    fn drain<S: Sink<T>>(&mut self, sink: &mut S) -> SinkResult<()> {
        loop {
            let index = self.next_expected_index;
            if let Some(payload) = self.buffered_full.remove(&index) {
                self.deliver_full(index, payload, sink)?;
            } else if self.buffered_missing.remove(&index) {
                self.next_expected_index = self.next_expected_index.saturating_add(1);
                self.resolve_missing();
                if self.options.write_missing_ts {
                    sink.write(Record::Placeholder {
                        meta: TimesliceMeta::placeholder(index),
                    })?;
                }
            } else {
                return Ok(());
            }
        }
    }

    fn deliver_full<S: Sink<T>>(
        &mut self,
        index: TimesliceIndex,
        payload: T,
        sink: &mut S,
    ) -> SinkResult<()> {
        if !self.options.bypass_consecutive_ts {
            self.next_expected_index = index.saturating_add(1);
            // A full timeslice overrides an earlier missing report for the same index.
            self.buffered_missing.remove(&index);
        }
        self.processed_count += 1;
        self.full_count += 1;
        self.last_progress = Instant::now();
        counter!(
            TIMESLICES_RESOLVED,
            &[timeslices_resolved::get_label(ResolutionKind::Full)]
        )
        .increment(1);
        sink.write(Record::Full { index, payload })
    }

    fn resolve_missing(&mut self) {
        self.processed_count += 1;
        self.missing_count += 1;
        self.last_progress = Instant::now();
        counter!(
            TIMESLICES_RESOLVED,
            &[timeslices_resolved::get_label(ResolutionKind::Missing)]
        )
        .increment(1);
    }

    fn is_complete(&self) -> bool {
        if !self.received_eof || self.processed_count != self.total_count {
            return false;
        }
        self.options.bypass_consecutive_ts
            || self.total_count == 0
            || self.last_index.checked_add(1) == Some(self.next_expected_index)
    }

    fn finalize<S: Sink<T>>(&mut self, forced: bool, sink: &mut S) -> SinkResult<()> {
        let report = SequencerReport {
            full_count: self.full_count,
            missing_count: self.missing_count,
            buffered_full: self.buffered_full.len(),
            buffered_missing: if self.options.bypass_consecutive_ts {
                0
            } else {
                self.buffered_missing.len()
            },
            forced,
        };
        if forced && (report.buffered_full > 0 || report.buffered_missing > 0) {
            warn!("Finalized with unresolved gaps: {report}");
        } else {
            info!("Finalized: {report}");
        }
        self.state = SequencerState::Finalized;
        self.buffered_full.clear();
        self.buffered_missing.clear();
        sink.close(&report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SinkError;
    use itertools::Itertools;

    #[derive(Default)]
    struct RecordingSink {
        records: Vec<Record<&'static str>>,
        report: Option<SequencerReport>,
    }

    impl RecordingSink {
        fn indices(&self) -> Vec<TimesliceIndex> {
            self.records.iter().map(Record::index).collect()
        }
    }

    impl Sink<&'static str> for RecordingSink {
        fn write(&mut self, record: Record<&'static str>) -> SinkResult<()> {
            if self.report.is_some() {
                return Err(SinkError::Closed {
                    index: record.index(),
                });
            }
            self.records.push(record);
            Ok(())
        }

        fn close(&mut self, report: &SequencerReport) -> SinkResult<()> {
            if self.report.is_some() {
                return Err(SinkError::AlreadyClosed);
            }
            self.report = Some(report.clone());
            Ok(())
        }
    }

    fn full(index: TimesliceIndex) -> SequencerInput<&'static str> {
        SequencerInput::FullTimeslice {
            index,
            payload: "ts",
        }
    }

    fn eof(last_index: TimesliceIndex, total_count: u64) -> SequencerInput<&'static str> {
        SequencerInput::Eof {
            last_index,
            total_count,
        }
    }

    fn writing_missing() -> SequencerOptions {
        SequencerOptions {
            write_missing_ts: true,
            ..Default::default()
        }
    }

    #[test]
    fn in_order_stream() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        for i in 0..3 {
            assert_eq!(
                sequencer.handle(full(i), &mut sink).unwrap(),
                SequencerState::Streaming
            );
        }
        assert_eq!(sink.indices(), vec![0, 1, 2]);
        assert_eq!(
            sequencer.handle(eof(2, 3), &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert_eq!(
            sink.report,
            Some(SequencerReport {
                full_count: 3,
                ..Default::default()
            })
        );
    }

    #[test]
    fn out_of_order_is_buffered() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(2), &mut sink).unwrap();
        sequencer.handle(full(1), &mut sink).unwrap();
        assert!(sink.records.is_empty());
        assert_eq!(sequencer.buffered_full_len(), 2);

        sequencer.handle(full(0), &mut sink).unwrap();
        assert_eq!(sink.indices(), vec![0, 1, 2]);
        assert_eq!(sequencer.buffered_full_len(), 0);
        assert_eq!(sequencer.next_expected_index(), 3);
    }

    #[test]
    fn missing_indices_close_gaps() {
        let mut sequencer = TimesliceSequencer::new(writing_missing());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(0), &mut sink).unwrap();
        sequencer.handle(full(3), &mut sink).unwrap();
        sequencer
            .handle(SequencerInput::MissingIndices(vec![2, 1]), &mut sink)
            .unwrap();

        assert_eq!(sink.indices(), vec![0, 1, 2, 3]);
        assert!(matches!(sink.records[1], Record::Placeholder { .. }));
        assert!(matches!(sink.records[2], Record::Placeholder { .. }));
        assert!(matches!(sink.records[3], Record::Full { index: 3, .. }));
        assert_eq!(sequencer.processed_count(), 4);
    }

    #[test]
    fn missing_indices_without_placeholders() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer
            .handle(SequencerInput::MissingIndices(vec![0]), &mut sink)
            .unwrap();
        sequencer.handle(full(1), &mut sink).unwrap();
        assert_eq!(sink.indices(), vec![1]);
        assert_eq!(sequencer.next_expected_index(), 2);
        assert_eq!(sequencer.processed_count(), 2);
    }

    #[test]
    fn any_permutation_is_delivered_in_order() {
        const N: u64 = 5;
        for order in (0..N).permutations(N as usize) {
            let mut sequencer = TimesliceSequencer::new(writing_missing());
            let mut sink = RecordingSink::default();
            for &index in &order {
                let input = if index % 3 == 1 {
                    SequencerInput::MissingIndices(vec![index])
                } else {
                    full(index)
                };
                sequencer.handle(input, &mut sink).unwrap();
            }
            assert_eq!(sink.indices(), (0..N).collect::<Vec<_>>(), "{order:?}");
            assert_eq!(
                sequencer.handle(eof(N - 1, N), &mut sink).unwrap(),
                SequencerState::Finalized
            );
        }
    }

    #[test]
    fn eof_waits_for_all_indices() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(0), &mut sink).unwrap();
        sequencer.handle(full(2), &mut sink).unwrap();
        assert_eq!(
            sequencer.handle(eof(3, 4), &mut sink).unwrap(),
            SequencerState::Draining
        );
        assert_eq!(
            sequencer
                .handle(SequencerInput::MissingIndices(vec![1]), &mut sink)
                .unwrap(),
            SequencerState::Draining
        );
        assert!(sink.report.is_none());
        assert_eq!(
            sequencer.handle(full(3), &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert_eq!(sink.indices(), vec![0, 2, 3]);
        assert_eq!(
            sink.report,
            Some(SequencerReport {
                full_count: 3,
                missing_count: 1,
                ..Default::default()
            })
        );
    }

    #[test]
    fn eof_at_largest_index_does_not_overflow() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(0), &mut sink).unwrap();
        assert_eq!(
            sequencer.handle(eof(u64::MAX, 1), &mut sink).unwrap(),
            SequencerState::Draining
        );
        assert!(sink.report.is_none());

        sequencer
            .handle(SequencerInput::MissingIndices(vec![u64::MAX]), &mut sink)
            .unwrap();
        assert_eq!(sequencer.state(), SequencerState::Draining);
        assert_eq!(sink.indices(), vec![0]);
    }

    #[test]
    fn eof_of_empty_stream() {
        let mut sequencer = TimesliceSequencer::<&'static str>::new(Default::default());
        let mut sink = RecordingSink::default();
        assert_eq!(
            sequencer.handle(eof(0, 0), &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert!(sink.report.is_some());
    }

    #[test]
    fn stop_forces_finalize() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(0), &mut sink).unwrap();
        sequencer.handle(full(2), &mut sink).unwrap();
        sequencer
            .handle(SequencerInput::MissingIndices(vec![5]), &mut sink)
            .unwrap();
        assert_eq!(
            sequencer.handle(SequencerInput::Stop, &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert_eq!(sink.indices(), vec![0]);
        assert_eq!(
            sink.report,
            Some(SequencerReport {
                full_count: 1,
                missing_count: 0,
                buffered_full: 1,
                buffered_missing: 1,
                forced: true,
            })
        );
        assert_eq!(sequencer.buffered_full_len(), 0);
        assert_eq!(sequencer.buffered_missing_len(), 0);
    }

    #[test]
    fn inputs_after_finalize_are_ignored() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(SequencerInput::Stop, &mut sink).unwrap();
        assert_eq!(
            sequencer.handle(full(0), &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert_eq!(
            sequencer.handle(SequencerInput::Stop, &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert!(sink.records.is_empty());
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(0), &mut sink).unwrap();
        sequencer.handle(full(0), &mut sink).unwrap();
        sequencer.handle(full(2), &mut sink).unwrap();
        sequencer.handle(full(2), &mut sink).unwrap();
        sequencer
            .handle(SequencerInput::MissingIndices(vec![0]), &mut sink)
            .unwrap();
        assert_eq!(sink.indices(), vec![0]);
        assert_eq!(sequencer.buffered_full_len(), 1);
        assert_eq!(sequencer.buffered_missing_len(), 0);

        sequencer.handle(full(1), &mut sink).unwrap();
        assert_eq!(sink.indices(), vec![0, 1, 2]);
    }

    #[test]
    fn full_timeslice_overrides_missing_report() {
        let mut sequencer = TimesliceSequencer::new(writing_missing());
        let mut sink = RecordingSink::default();
        sequencer
            .handle(SequencerInput::MissingIndices(vec![1]), &mut sink)
            .unwrap();
        sequencer.handle(full(1), &mut sink).unwrap();
        sequencer.handle(full(0), &mut sink).unwrap();
        assert_eq!(sink.indices(), vec![0, 1]);
        assert!(matches!(sink.records[1], Record::Full { index: 1, .. }));
        assert_eq!(sequencer.buffered_missing_len(), 0);
    }

    #[test]
    fn bypass_writes_in_arrival_order() {
        let mut sequencer = TimesliceSequencer::new(SequencerOptions {
            bypass_consecutive_ts: true,
            ..Default::default()
        });
        let mut sink = RecordingSink::default();
        sequencer.handle(full(2), &mut sink).unwrap();
        sequencer.handle(full(0), &mut sink).unwrap();
        sequencer
            .handle(SequencerInput::MissingIndices(vec![1, 1]), &mut sink)
            .unwrap();
        assert_eq!(sink.indices(), vec![2, 0]);
        assert_eq!(
            sequencer.handle(eof(3, 4), &mut sink).unwrap(),
            SequencerState::Draining
        );
        assert_eq!(
            sequencer.handle(full(3), &mut sink).unwrap(),
            SequencerState::Finalized
        );
        assert_eq!(
            sink.report,
            Some(SequencerReport {
                full_count: 3,
                missing_count: 1,
                ..Default::default()
            })
        );
    }

    #[test]
    fn gap_timeout_skips_stalled_index() {
        let mut sequencer = TimesliceSequencer::new(SequencerOptions {
            gap_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let mut sink = RecordingSink::default();
        sequencer.handle(full(1), &mut sink).unwrap();
        sequencer.handle(eof(1, 2), &mut sink).unwrap();

        let now = Instant::now();
        assert_eq!(
            sequencer.poll(now, &mut sink).unwrap(),
            SequencerState::Draining
        );
        assert!(sink.records.is_empty());

        assert_eq!(
            sequencer
                .poll(now + Duration::from_secs(60), &mut sink)
                .unwrap(),
            SequencerState::Finalized
        );
        assert_eq!(sink.indices(), vec![1]);
        assert_eq!(
            sink.report,
            Some(SequencerReport {
                full_count: 1,
                missing_count: 1,
                ..Default::default()
            })
        );
    }

    #[test]
    fn no_gap_timeout_stalls() {
        let mut sequencer = TimesliceSequencer::new(Default::default());
        let mut sink = RecordingSink::default();
        sequencer.handle(full(1), &mut sink).unwrap();
        assert_eq!(
            sequencer
                .poll(Instant::now() + Duration::from_secs(3600), &mut sink)
                .unwrap(),
            SequencerState::Streaming
        );
        assert!(sink.records.is_empty());
        assert_eq!(sequencer.buffered_full_len(), 1);
    }

    #[test]
    fn gap_timeout_ignores_idle_stream() {
        let mut sequencer = TimesliceSequencer::<&'static str>::new(SequencerOptions {
            gap_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        let mut sink = RecordingSink::default();
        sequencer
            .poll(Instant::now() + Duration::from_secs(1), &mut sink)
            .unwrap();
        assert_eq!(sequencer.next_expected_index(), 0);
        assert_eq!(sequencer.processed_count(), 0);
    }

    #[test]
    fn control_commands_convert_to_inputs() {
        assert_eq!(
            SequencerInput::<()>::from(ControlCommand::Eof {
                last_index: 3,
                total_count: 4
            }),
            SequencerInput::Eof {
                last_index: 3,
                total_count: 4
            }
        );
        assert_eq!(
            SequencerInput::<()>::from(ControlCommand::Stop),
            SequencerInput::Stop
        );
    }
}

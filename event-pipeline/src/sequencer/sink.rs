use super::SequencerReport;
use crate::error::{SinkError, SinkResult};
use digi_event_common::{
    DigiEvent, DigiTimeslice, EventNumber, TimesliceIndex, TimesliceMeta,
    metrics::names::{EVENTS_WRITTEN, RECORDS_WRITTEN},
};
use metrics::counter;
use tracing::{debug, info};

/// What the sequencer hands to the sink, one timeslice at a time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record<T> {
    Full { index: TimesliceIndex, payload: T },
    /// Stands in for a timeslice reported missing.
    Placeholder { meta: TimesliceMeta },
}

impl<T> Record<T> {
    pub(crate) fn index(&self) -> TimesliceIndex {
        match self {
            Record::Full { index, .. } => *index,
            Record::Placeholder { meta } => meta.index,
        }
    }
}

/// Receives the ordered stream of records.
pub(crate) trait Sink<T> {
    fn write(&mut self, record: Record<T>) -> SinkResult<()>;

    /// Called exactly once when the sequencer finalizes.
    fn close(&mut self, report: &SequencerReport) -> SinkResult<()>;
}

/// Events built from one timeslice.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BuiltTimeslice {
    pub(crate) meta: TimesliceMeta,
    pub(crate) events: Vec<DigiEvent>,
    /// The full timeslice the events' range slices point into. When absent the
    /// events own their digis.
    pub(crate) full: Option<DigiTimeslice>,
}

impl BuiltTimeslice {
    pub(crate) fn new(
        timeslice: DigiTimeslice,
        events: Vec<DigiEvent>,
        store_full_ts: bool,
    ) -> Self {
        if store_full_ts {
            Self {
                meta: timeslice.meta,
                events,
                full: Some(timeslice),
            }
        } else {
            Self {
                meta: timeslice.meta,
                events: events
                    .into_iter()
                    .map(|event| event.into_owned(&timeslice))
                    .collect(),
                full: None,
            }
        }
    }
}

/// Numbers the events of the ordered stream before handing it on.
///
/// Builder workers number their events independently, so the numbers are only
/// assigned for good once the timeslices are in order.
pub(crate) struct EventNumbering<S> {
    inner: S,
    next_number: EventNumber,
}

impl<S> EventNumbering<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            next_number: 0,
        }
    }

    pub(crate) fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Sink<BuiltTimeslice>> Sink<BuiltTimeslice> for EventNumbering<S> {
    fn write(&mut self, mut record: Record<BuiltTimeslice>) -> SinkResult<()> {
        if let Record::Full { payload, .. } = &mut record {
            for event in &mut payload.events {
                event.number = self.next_number;
                self.next_number += 1;
            }
        }
        self.inner.write(record)
    }

    fn close(&mut self, report: &SequencerReport) -> SinkResult<()> {
        self.inner.close(report)
    }
}

/// Logs every record it receives.
#[derive(Default)]
pub(crate) struct LoggingSink {
    records: u64,
    events: u64,
    closed: bool,
}

impl LoggingSink {
    pub(crate) fn records(&self) -> u64 {
        self.records
    }

    pub(crate) fn events(&self) -> u64 {
        self.events
    }
}

impl Sink<BuiltTimeslice> for LoggingSink {
    fn write(&mut self, record: Record<BuiltTimeslice>) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed {
                index: record.index(),
            });
        }
        match &record {
            Record::Full { index, payload } => {
                let digis: usize = payload.events.iter().map(DigiEvent::num_digis).sum();
                debug!(
                    "Timeslice {index}: {} events, {digis} digis, full timeslice {}",
                    payload.events.len(),
                    if payload.full.is_some() { "kept" } else { "dropped" }
                );
                self.events += payload.events.len() as u64;
                counter!(EVENTS_WRITTEN).increment(payload.events.len() as u64);
            }
            Record::Placeholder { meta } => {
                debug!("Timeslice {}: placeholder", meta.index);
            }
        }
        self.records += 1;
        counter!(RECORDS_WRITTEN).increment(1);
        Ok(())
    }

    fn close(&mut self, report: &SequencerReport) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::AlreadyClosed);
        }
        self.closed = true;
        info!(
            "Sink closed after writing {} records with {} events ({report})",
            self.records, self.events
        );
        Ok(())
    }
}

//! The async tasks connecting the pipeline components.
use crate::{
    builder::{self, BuilderState, EventBuilderConfig},
    error::{ControlError, SinkError},
    sequencer::{
        BuiltTimeslice, ControlCommand, EventNumbering, SequencerInput, SequencerState, Sink,
        TimesliceSequencer,
    },
    simulator::{self, Simulator},
    trigger::{ClusterParameters, TimeClusterTrigger},
};
use digi_event_common::{
    DigiTimeslice, EventNumber, TimesliceIndex,
    metrics::{
        control_commands::{self, CommandKind},
        failures::{self, FailureKind},
        names::{CONTROL_COMMANDS, FAILURES, TIMESLICES_RECEIVED, TRIGGERS_FOUND},
    },
};
use metrics::counter;
use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::{JoinError, JoinSet},
};
use tracing::{debug, error, info, trace, warn};

/// Receiver shared by all builder workers, each taking the next timeslice when it is idle.
pub(crate) type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Turns one timeslice into the events the sequencer receives.
#[derive(Debug)]
pub(crate) struct BuilderStage {
    pub(crate) trigger: ClusterParameters,
    pub(crate) config: EventBuilderConfig,
    pub(crate) store_full_ts: bool,
}

/// State a builder worker carries from one timeslice to the next.
#[derive(Default, Debug)]
pub(crate) struct WorkerState {
    builder: BuilderState,
    trigger: Option<TimeClusterTrigger>,
    last_index: Option<TimesliceIndex>,
}

impl WorkerState {
    /// The trigger for `index`, reset unless `index` directly follows the previous timeslice.
    fn trigger_for(
        &mut self,
        index: TimesliceIndex,
        parameters: &ClusterParameters,
    ) -> &mut TimeClusterTrigger {
        let consecutive = self
            .last_index
            .is_some_and(|last| last.checked_add(1) == Some(index));
        self.last_index = Some(index);
        if !consecutive {
            if let Some(trigger) = &self.trigger {
                trace!(
                    "Resetting trigger at timeslice {index}, last trigger {:?}",
                    trigger.last_trigger()
                );
            }
            self.trigger = None;
        }
        self.trigger
            .get_or_insert_with(|| TimeClusterTrigger::new(parameters.clone()))
    }

    pub(crate) fn events_emitted(&self) -> EventNumber {
        self.builder.events_emitted()
    }
}

impl BuilderStage {
    #[tracing::instrument(skip_all, level = "trace", fields(index = timeslice.index()))]
    pub(crate) fn process(
        &self,
        timeslice: DigiTimeslice,
        state: &mut WorkerState,
    ) -> BuiltTimeslice {
        if !timeslice.has_detector(self.config.reference_detector) {
            debug!(
                "Timeslice {} has no {} digis",
                timeslice.index(),
                self.config.reference_detector
            );
        }
        // Dead time carries over only between consecutive timeslices.
        let trigger = state.trigger_for(timeslice.index(), &self.trigger);
        let triggers = trigger.find(timeslice.digis(self.config.reference_detector));
        counter!(TRIGGERS_FOUND).increment(triggers.len() as u64);

        let events = builder::build(&timeslice, &triggers, &self.config, &mut state.builder);
        debug!(
            "Timeslice {}: {} triggers, {} events",
            timeslice.index(),
            triggers.len(),
            events.len()
        );
        BuiltTimeslice::new(timeslice, events, self.store_full_ts)
    }
}

/// Builds events until the input channel is closed.
#[tracing::instrument(skip_all, level = "debug", fields(worker = worker))]
pub(crate) async fn run_builder(
    worker: usize,
    stage: Arc<BuilderStage>,
    input: SharedReceiver<DigiTimeslice>,
    output: mpsc::Sender<BuiltTimeslice>,
) {
    let mut state = WorkerState::default();
    loop {
        let Some(timeslice) = input.lock().await.recv().await else {
            break;
        };
        counter!(TIMESLICES_RECEIVED).increment(1);

        let built = stage.process(timeslice, &mut state);
        if output.send(built).await.is_err() {
            warn!("Sequencer stage has gone away, stopping builder {worker}");
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::StageDisconnected)]
            )
            .increment(1);
            break;
        }
    }
    info!(
        "Builder {worker} done after building {} events",
        state.events_emitted()
    );
}

/// Inbound channels of the sequencer stage.
pub(crate) struct SequencerChannels {
    pub(crate) data: mpsc::Receiver<BuiltTimeslice>,
    pub(crate) missing: mpsc::Receiver<Vec<TimesliceIndex>>,
    pub(crate) control: mpsc::Receiver<String>,
}

/// Parses a control string, logging and counting anything that is not a valid command.
pub(crate) fn parse_command<T>(command: &str) -> Option<SequencerInput<T>> {
    match ControlCommand::from_str(command) {
        Ok(command) => {
            let kind = match command {
                ControlCommand::Eof { .. } => CommandKind::Eof,
                ControlCommand::Stop => CommandKind::Stop,
            };
            counter!(CONTROL_COMMANDS, &[control_commands::get_label(kind)]).increment(1);
            Some(command.into())
        }
        Err(ControlError::Unknown(tag)) => {
            warn!("Unknown command received: {tag} => will be ignored");
            counter!(
                CONTROL_COMMANDS,
                &[control_commands::get_label(CommandKind::Unknown)]
            )
            .increment(1);
            None
        }
        Err(e) => {
            error!("{e}");
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::MalformedCommand)]
            )
            .increment(1);
            None
        }
    }
}

/// Feeds the sequencer from its channels until the stream is finalized, then returns the sink.
///
/// Events are numbered in delivery order on their way to the sink.
#[tracing::instrument(skip_all, level = "debug")]
pub(crate) async fn run_sequencer<S: Sink<BuiltTimeslice>>(
    mut sequencer: TimesliceSequencer<BuiltTimeslice>,
    mut channels: SequencerChannels,
    sink: S,
    poll_interval: Duration,
) -> S {
    let mut sink = EventNumbering::new(sink);
    let mut poll = tokio::time::interval(poll_interval);
    while sequencer.state() != SequencerState::Finalized {
        let input = tokio::select! {
            Some(built) = channels.data.recv() => SequencerInput::FullTimeslice {
                index: built.meta.index,
                payload: built,
            },
            Some(indices) = channels.missing.recv() => SequencerInput::MissingIndices(indices),
            Some(command) = channels.control.recv() => match parse_command(&command) {
                Some(input) => input,
                None => continue,
            },
            _ = poll.tick() => {
                sequencer.update_gauges();
                if let Err(e) = sequencer.poll(Instant::now(), &mut sink) {
                    sink_failure(&e);
                }
                continue;
            }
        };
        trace!("Sequencer input: {}", input_kind(&input));
        if let Err(e) = sequencer.handle(input, &mut sink) {
            sink_failure(&e);
        }
        trace!(
            "Next expected {}, buffered {} full and {} missing",
            sequencer.next_expected_index(),
            sequencer.buffered_full_len(),
            sequencer.buffered_missing_len()
        );
    }
    sequencer.update_gauges();
    info!(
        "Sequencer finished after resolving {} timeslices",
        sequencer.processed_count()
    );
    sink.into_inner()
}

/// The stages between the timeslice source and the sink.
pub(crate) struct Pipeline {
    pub(crate) builder_stage: Arc<BuilderStage>,
    pub(crate) builders: usize,
    pub(crate) channel_capacity: usize,
    pub(crate) poll_interval: Duration,
}

impl Pipeline {
    /// Runs the source, the builders and the sequencer until the sequencer finalizes,
    /// then stops the source and waits for every task.
    ///
    /// `control_tx` is handed to the source for its end-of-stream command.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) async fn run<S>(
        self,
        simulator: Simulator,
        sequencer: TimesliceSequencer<BuiltTimeslice>,
        sink: S,
        control_tx: mpsc::Sender<String>,
        control_rx: mpsc::Receiver<String>,
    ) -> Result<S, JoinError>
    where
        S: Sink<BuiltTimeslice> + Send + 'static,
    {
        let capacity = self.channel_capacity.max(1);
        let (timeslice_tx, timeslice_rx) = mpsc::channel(capacity);
        let (built_tx, built_rx) = mpsc::channel(capacity);
        let (missing_tx, missing_rx) = mpsc::channel(capacity);

        let simulator_task = tokio::spawn(simulator::run_simulator(
            simulator,
            timeslice_tx,
            missing_tx,
            control_tx,
        ));

        let input = Arc::new(Mutex::new(timeslice_rx));
        let mut builders = JoinSet::new();
        for worker in 0..self.builders.max(1) {
            builders.spawn(run_builder(
                worker,
                self.builder_stage.clone(),
                input.clone(),
                built_tx.clone(),
            ));
        }
        // The workers hold the only handles, so the channels close when they finish.
        drop(input);
        drop(built_tx);

        let sequencer_task = tokio::spawn(run_sequencer(
            sequencer,
            SequencerChannels {
                data: built_rx,
                missing: missing_rx,
                control: control_rx,
            },
            sink,
            self.poll_interval,
        ));
        let sink = sequencer_task.await?;

        // Nothing reads the timeslices any more.
        simulator_task.abort();
        while let Some(result) = builders.join_next().await {
            if let Err(e) = result {
                error!("Builder task failed: {e}");
            }
        }
        match simulator_task.await {
            Err(e) if !e.is_cancelled() => error!("Simulator task failed: {e}"),
            _ => debug!("Simulator stopped"),
        }
        Ok(sink)
    }
}

fn input_kind<T>(input: &SequencerInput<T>) -> String {
    match input {
        SequencerInput::FullTimeslice { index, .. } => format!("full timeslice {index}"),
        SequencerInput::MissingIndices(indices) => format!("missing {indices:?}"),
        SequencerInput::Eof {
            last_index,
            total_count,
        } => format!("EOF {last_index} {total_count}"),
        SequencerInput::Stop => "STOP".to_owned(),
    }
}

fn sink_failure(e: &SinkError) {
    error!("Sink write failed: {e}");
    counter!(
        FAILURES,
        &[failures::get_label(FailureKind::SinkWriteFailed)]
    )
    .increment(1);
}

mod builder;
mod error;
mod parameters;
mod sequencer;
mod simulator;
mod stage;
mod trigger;

use anyhow::Result;
use builder::EventBuilderConfig;
use clap::Parser;
use digi_event_common::{
    metrics::{
        component_info_metric,
        names::{
            BUFFERED_FULL, BUFFERED_MISSING, CONTROL_COMMANDS, EVENTS_BUILT, EVENTS_REJECTED,
            EVENTS_WRITTEN, FAILURES, GAPS_SKIPPED, NEXT_EXPECTED_INDEX, RECORDS_WRITTEN,
            TIMESLICES_RECEIVED, TIMESLICES_RESOLVED, TRIGGERS_FOUND,
        },
    },
    tracer::TracerEngine,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use parameters::{Mode, RunConfig};
use sequencer::{ControlCommand, LoggingSink, SequencerOptions, TimesliceSequencer};
use simulator::Simulator;
use stage::{BuilderStage, Pipeline};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Cli {
    /// JSON file holding the run configuration, used instead of the run configuration flags
    #[clap(long)]
    config_file: Option<PathBuf>,

    #[clap(flatten)]
    run: RunConfig,

    /// Number of builder workers
    #[clap(long, default_value = "1")]
    builders: usize,

    /// Interval at which the sequencer updates its gauges and checks for stalled gaps
    #[clap(long, default_value = "500")]
    cache_poll_ms: u64,

    /// If set, a gap which has not closed after this long is declared missing
    #[clap(long)]
    gap_timeout_ms: Option<u64>,

    /// Capacity of the channels between the stages
    #[clap(long, default_value = "16")]
    channel_capacity: usize,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,

    #[command(subcommand)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let tracer = TracerEngine::new("digi-event-pipeline")?;
    debug!("Args: {:?}", args);

    // Set up metrics
    let builder = PrometheusBuilder::new();
    builder
        .with_http_listener(args.observability_address)
        .install()?;
    describe_metrics();
    component_info_metric("digi-event-pipeline");

    let run = match &args.config_file {
        Some(path) => RunConfig::from_file(path)?,
        None => args.run.clone(),
    };
    let config = EventBuilderConfig::from_parameters(&run.builder).inspect_err(|e| {
        error!("{e}, no triggers can be produced");
    })?;
    if let Some(reference) = config.detector(config.reference_detector) {
        info!(
            "Reference window [{}, {}) ns",
            reference.win_begin_ns, reference.win_end_ns
        );
    }

    let (control_tx, control_rx) = mpsc::channel(args.channel_capacity.max(1));

    let Mode::Simulate(simulation) = args.mode;
    let detectors = config.detectors.iter().map(|det| det.detector).collect();
    let simulator = Simulator::new(simulation, detectors)?;

    let pipeline = Pipeline {
        builder_stage: Arc::new(BuilderStage {
            trigger: (&run.trigger).into(),
            config,
            store_full_ts: run.sequencer.store_full_ts,
        }),
        builders: args.builders,
        channel_capacity: args.channel_capacity,
        poll_interval: Duration::from_millis(args.cache_poll_ms),
    };
    let sequencer = TimesliceSequencer::new(SequencerOptions {
        write_missing_ts: run.sequencer.write_missing_ts,
        bypass_consecutive_ts: run.sequencer.bypass_consecutive_ts,
        gap_timeout: args.gap_timeout_ms.map(Duration::from_millis),
    });

    // Is used to await any sigint signals
    let mut sigint = signal(SignalKind::interrupt())?;
    let stop_tx = control_tx.clone();
    tokio::spawn(async move {
        if sigint.recv().await.is_some() {
            info!("Interrupted, sending {}", ControlCommand::Stop);
            if stop_tx.send(ControlCommand::Stop.to_string()).await.is_err() {
                warn!("Sequencer already finished");
            }
        }
    });

    let sink = pipeline
        .run(
            simulator,
            sequencer,
            LoggingSink::default(),
            control_tx,
            control_rx,
        )
        .await?;
    info!(
        "{}: wrote {} records with {} events",
        tracer.service_name(),
        sink.records(),
        sink.events()
    );
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        TIMESLICES_RECEIVED,
        metrics::Unit::Count,
        "Number of timeslices received by the builders"
    );
    metrics::describe_counter!(
        TRIGGERS_FOUND,
        metrics::Unit::Count,
        "Number of triggers found in the reference detector"
    );
    metrics::describe_counter!(
        EVENTS_BUILT,
        metrics::Unit::Count,
        "Number of events passing the quality cuts"
    );
    metrics::describe_counter!(
        EVENTS_REJECTED,
        metrics::Unit::Count,
        "Number of events failing the quality cuts"
    );
    metrics::describe_counter!(
        TIMESLICES_RESOLVED,
        metrics::Unit::Count,
        "Number of timeslice indices resolved by the sequencer"
    );
    metrics::describe_counter!(
        RECORDS_WRITTEN,
        metrics::Unit::Count,
        "Number of records written by the sink"
    );
    metrics::describe_counter!(
        EVENTS_WRITTEN,
        metrics::Unit::Count,
        "Number of events written by the sink"
    );
    metrics::describe_counter!(
        CONTROL_COMMANDS,
        metrics::Unit::Count,
        "Number of control commands received"
    );
    metrics::describe_counter!(
        GAPS_SKIPPED,
        metrics::Unit::Count,
        "Number of timeslice indices declared missing after the gap timeout"
    );
    metrics::describe_counter!(
        FAILURES,
        metrics::Unit::Count,
        "Number of failures encountered"
    );
    metrics::describe_gauge!(
        BUFFERED_FULL,
        metrics::Unit::Count,
        "Full timeslices waiting in the sequencer"
    );
    metrics::describe_gauge!(
        BUFFERED_MISSING,
        metrics::Unit::Count,
        "Missing indices waiting in the sequencer"
    );
    metrics::describe_gauge!(
        NEXT_EXPECTED_INDEX,
        "Next timeslice index the sequencer can deliver"
    );
}

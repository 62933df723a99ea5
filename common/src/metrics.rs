use metrics::{describe_gauge, gauge};

pub fn component_info_metric(name: &'static str) {
    static NAME: &str = "digi_event_pipeline_component_info";

    describe_gauge!(NAME, "Basic information about the component");

    let git_rev = option_env!("GIT_VERSION").unwrap_or("unknown");
    gauge!(NAME, "component" => name, "git_version" => git_rev).set(1.0);
}

pub mod names {
    use const_format::concatcp;

    pub const METRIC_NAME_PREFIX: &str = "digi_event_pipeline_";

    pub const FAILURES: &str = concatcp!(METRIC_NAME_PREFIX, "failures");
    pub const TIMESLICES_RECEIVED: &str = concatcp!(METRIC_NAME_PREFIX, "timeslices_received");
    pub const TRIGGERS_FOUND: &str = concatcp!(METRIC_NAME_PREFIX, "triggers_found");
    pub const EVENTS_BUILT: &str = concatcp!(METRIC_NAME_PREFIX, "events_built");
    pub const EVENTS_REJECTED: &str = concatcp!(METRIC_NAME_PREFIX, "events_rejected");
    pub const TIMESLICES_RESOLVED: &str = concatcp!(METRIC_NAME_PREFIX, "timeslices_resolved");
    pub const RECORDS_WRITTEN: &str = concatcp!(METRIC_NAME_PREFIX, "records_written");
    pub const EVENTS_WRITTEN: &str = concatcp!(METRIC_NAME_PREFIX, "events_written");
    pub const CONTROL_COMMANDS: &str = concatcp!(METRIC_NAME_PREFIX, "control_commands");
    pub const GAPS_SKIPPED: &str = concatcp!(METRIC_NAME_PREFIX, "gaps_skipped");
    pub const BUFFERED_FULL: &str = concatcp!(METRIC_NAME_PREFIX, "sequencer_buffered_full");
    pub const BUFFERED_MISSING: &str = concatcp!(METRIC_NAME_PREFIX, "sequencer_buffered_missing");
    pub const NEXT_EXPECTED_INDEX: &str =
        concatcp!(METRIC_NAME_PREFIX, "sequencer_next_expected_index");
}

pub mod timeslices_resolved {
    #[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
    pub enum ResolutionKind {
        Full,
        Missing,
    }

    // Label building function
    pub fn get_label(resolution_kind: ResolutionKind) -> (&'static str, &'static str) {
        (
            "resolution_kind",
            match resolution_kind {
                ResolutionKind::Full => "full",
                ResolutionKind::Missing => "missing",
            },
        )
    }
}

pub mod control_commands {
    #[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
    pub enum CommandKind {
        Eof,
        Stop,
        Unknown,
    }

    // Label building function
    pub fn get_label(command_kind: CommandKind) -> (&'static str, &'static str) {
        (
            "command_kind",
            match command_kind {
                CommandKind::Eof => "eof",
                CommandKind::Stop => "stop",
                CommandKind::Unknown => "unknown",
            },
        )
    }
}

pub mod failures {
    #[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
    pub enum FailureKind {
        DuplicateTimeslice,
        MalformedCommand,
        SinkWriteFailed,
        StageDisconnected,
    }

    // Label building function
    pub fn get_label(failure_kind: FailureKind) -> (&'static str, &'static str) {
        (
            "failure_kind",
            match failure_kind {
                FailureKind::DuplicateTimeslice => "duplicate_timeslice",
                FailureKind::MalformedCommand => "malformed_command",
                FailureKind::SinkWriteFailed => "sink_write_failed",
                FailureKind::StageDisconnected => "stage_disconnected",
            },
        )
    }
}

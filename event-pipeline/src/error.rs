use digi_event_common::TimesliceIndex;
use std::{num::ParseFloatError, num::ParseIntError, path::PathBuf};
use thiserror::Error;

pub(crate) type ConfigResult<T> = Result<T, ConfigError>;
pub(crate) type SinkResult<T> = Result<T, SinkError>;
pub(crate) type SimulationResult<T> = Result<T, SimulationError>;

#[derive(Clone, Copy, Debug, strum::Display)]
pub(crate) enum ConfigEntry {
    #[strum(to_string = "window")]
    Window,
    #[strum(to_string = "min count")]
    MinCount,
    #[strum(to_string = "max count")]
    MaxCount,
    #[strum(to_string = "min layers")]
    MinLayers,
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Unknown detector '{0}'")]
    UnknownDetector(String),
    #[error("Reference detector '{0}' does not resolve to a known detector")]
    UnresolvedReferenceDetector(String),
    #[error("Incorrect number of parameters in {entry}, expected {expected} got '{input}'")]
    FieldCount {
        entry: ConfigEntry,
        expected: usize,
        input: String,
    },
    #[error("Invalid number in {entry} '{input}': {source}")]
    InvalidFloat {
        entry: ConfigEntry,
        input: String,
        source: ParseFloatError,
    },
    #[error("Invalid number in {entry} '{input}': {source}")]
    InvalidInteger {
        entry: ConfigEntry,
        input: String,
        source: ParseIntError,
    },
    #[error("Window begin {begin} is not before window end {end} in '{input}'")]
    EmptyWindow { begin: f64, end: f64, input: String },
    #[error("Cannot read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum ControlError {
    #[error("Empty command")]
    Empty,
    #[error("Incomplete EOF command received: '{0}'")]
    IncompleteEof(String),
    #[error("Invalid index in EOF command '{0}'")]
    InvalidEofIndex(String),
    #[error("Unknown command received: '{0}'")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub(crate) enum SinkError {
    #[error("Record for timeslice {index} delivered after the sink was closed")]
    Closed { index: TimesliceIndex },
    #[error("Sink closed twice")]
    AlreadyClosed,
}

#[derive(Debug, Error)]
pub(crate) enum SimulationError {
    #[error("Invalid simulation parameter {name} = {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

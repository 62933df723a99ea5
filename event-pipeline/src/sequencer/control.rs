use crate::error::ControlError;
use digi_event_common::TimesliceIndex;
use std::{fmt::Display, str::FromStr};

/// Commands received on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    /// `EOF <lastIndex> <totalCount>`
    Eof {
        last_index: TimesliceIndex,
        total_count: u64,
    },
    /// `STOP`
    Stop,
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        match tokens.next() {
            None => Err(ControlError::Empty),
            Some("EOF") => {
                let fields: Vec<_> = tokens.collect();
                let [last_index, total_count] = fields.as_slice() else {
                    return Err(ControlError::IncompleteEof(s.to_owned()));
                };
                let parse = |field: &str| {
                    u64::from_str(field).map_err(|_| ControlError::InvalidEofIndex(s.to_owned()))
                };
                Ok(ControlCommand::Eof {
                    last_index: parse(*last_index)?,
                    total_count: parse(*total_count)?,
                })
            }
            Some("STOP") => Ok(ControlCommand::Stop),
            Some(tag) => Err(ControlError::Unknown(tag.to_owned())),
        }
    }
}

impl Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCommand::Eof {
                last_index,
                total_count,
            } => write!(f, "EOF {last_index} {total_count}"),
            ControlCommand::Stop => write!(f, "STOP"),
        }
    }
}

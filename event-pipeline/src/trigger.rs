use crate::parameters::TriggerParameters;
use digi_event_common::{Digi, Time};
use tracing::trace;

#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ClusterParameters {
    /// Largest gap between consecutive members of a cluster (ns).
    pub(crate) window: Time,
    pub(crate) min_digis: u32,
    /// Minimum spacing between two emitted triggers (ns).
    pub(crate) dead_time: Time,
}

impl From<&TriggerParameters> for ClusterParameters {
    fn from(parameters: &TriggerParameters) -> Self {
        Self {
            window: parameters.window,
            min_digis: parameters.min_digis,
            dead_time: parameters.dead_time,
        }
    }
}

/// Groups sorted timestamps into gap-separated clusters and returns one trigger per
/// accepted cluster, placed at the cluster's first member.
///
/// `last_trigger` carries the dead-time state between calls.
pub(crate) fn cluster(
    times: &[Time],
    window: Time,
    min_digis: u32,
    dead_time: Time,
    last_trigger: &mut Option<Time>,
) -> Vec<Time> {
    let mut triggers = Vec::new();

    let mut iter = times.iter().copied();
    let Some(mut first) = iter.next() else {
        return triggers;
    };
    let mut last = first;
    let mut size: u32 = 1;

    let mut close = |first: Time, size: u32, triggers: &mut Vec<Time>| {
        if size < min_digis {
            return;
        }
        match *last_trigger {
            Some(previous) if first - previous < dead_time => {
                trace!("Candidate {first} within dead time of {previous}");
            }
            _ => {
                *last_trigger = Some(first);
                triggers.push(first);
            }
        }
    };

    for time in iter {
        if time - last <= window {
            size += 1;
        } else {
            close(first, size, &mut triggers);
            first = time;
            size = 1;
        }
        last = time;
    }
    close(first, size, &mut triggers);

    triggers
}

/// Time cluster trigger over a reference detector's digis.
#[derive(Default, Debug, Clone)]
pub(crate) struct TimeClusterTrigger {
    parameters: ClusterParameters,
    last_trigger: Option<Time>,
}

impl TimeClusterTrigger {
    pub(crate) fn new(parameters: ClusterParameters) -> Self {
        Self {
            parameters,
            last_trigger: None,
        }
    }

    pub(crate) fn find(&mut self, digis: &[Digi]) -> Vec<Time> {
        let times: Vec<Time> = digis.iter().map(|digi| digi.time).collect();
        cluster(
            &times,
            self.parameters.window,
            self.parameters.min_digis,
            self.parameters.dead_time,
            &mut self.last_trigger,
        )
    }

    pub(crate) fn last_trigger(&self) -> Option<Time> {
        self.last_trigger
    }
}

//! Synthetic source feeding the pipeline with random timeslices.
use crate::{
    error::{SimulationError, SimulationResult},
    parameters::SimulationParameters,
    sequencer::ControlCommand,
};
use digi_event_common::{
    ChannelAddress, DetectorId, Digi, DigiTimeslice, LAYER_SHIFT, TRD_2D_FLAG, Time,
    TimesliceIndex, TimesliceMeta,
};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, Exp, Normal, Poisson};
use std::{collections::BTreeMap, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How one timeslice index reaches the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Full(TimesliceIndex),
    Missing(TimesliceIndex),
}

impl Delivery {
    pub(crate) fn index(&self) -> TimesliceIndex {
        match self {
            Delivery::Full(index) | Delivery::Missing(index) => *index,
        }
    }
}

pub(crate) struct Simulator {
    parameters: SimulationParameters,
    detectors: Vec<DetectorId>,
    rng: StdRng,
    cluster_interval: Exp<f64>,
    cluster_size: Poisson<f64>,
    spread: Normal<f64>,
    noise: Option<Poisson<f64>>,
}

impl Simulator {
    pub(crate) fn new(
        parameters: SimulationParameters,
        detectors: Vec<DetectorId>,
    ) -> SimulationResult<Self> {
        let seed = parameters.seed.unwrap_or_else(|| rand::rng().random());
        info!("Simulating {} timeslices with seed {seed}", parameters.timeslices);

        if parameters.mean_cluster_interval_ns <= 0.0 {
            return Err(SimulationError::InvalidParameter {
                name: "mean-cluster-interval-ns",
                value: parameters.mean_cluster_interval_ns,
            });
        }
        let cluster_interval = Exp::new(1.0 / parameters.mean_cluster_interval_ns).map_err(
            invalid("mean-cluster-interval-ns", parameters.mean_cluster_interval_ns),
        )?;
        let cluster_size = Poisson::new(parameters.mean_cluster_size)
            .map_err(invalid("mean-cluster-size", parameters.mean_cluster_size))?;
        let spread = Normal::new(0.0, parameters.cluster_spread_ns)
            .map_err(invalid("cluster-spread-ns", parameters.cluster_spread_ns))?;
        let noise = if parameters.noise_digis > 0.0 {
            Some(
                Poisson::new(parameters.noise_digis)
                    .map_err(invalid("noise-digis", parameters.noise_digis))?,
            )
        } else {
            None
        };
        if !(0.0..=1.0).contains(&parameters.missing_probability) {
            return Err(SimulationError::InvalidParameter {
                name: "missing-probability",
                value: parameters.missing_probability,
            });
        }

        Ok(Self {
            parameters,
            detectors,
            rng: StdRng::seed_from_u64(seed),
            cluster_interval,
            cluster_size,
            spread,
            noise,
        })
    }

    /// The order in which timeslices are handed to the pipeline.
    ///
    /// Each index appears once. Indices are only shuffled within consecutive
    /// blocks of `shuffle_depth`.
    pub(crate) fn plan(&mut self) -> Vec<Delivery> {
        let mut plan: Vec<Delivery> = (0..self.parameters.timeslices)
            .map(|index| {
                if self.rng.random_bool(self.parameters.missing_probability) {
                    Delivery::Missing(index)
                } else {
                    Delivery::Full(index)
                }
            })
            .collect();
        for block in plan.chunks_mut(self.parameters.shuffle_depth.max(1)) {
            block.shuffle(&mut self.rng);
        }
        plan
    }

    pub(crate) fn timeslice(&mut self, index: TimesliceIndex) -> DigiTimeslice {
        let meta = TimesliceMeta {
            index,
            start_time_ns: index as Time * self.parameters.core_duration_ns,
            core_duration_ns: self.parameters.core_duration_ns,
            overlap_duration_ns: self.parameters.overlap_duration_ns,
        };
        let begin = meta.start_time_ns;
        let end = meta.core_end() + meta.overlap_duration_ns;

        let mut storage = BTreeMap::<DetectorId, Vec<Digi>>::new();

        let mut cluster = begin + self.cluster_interval.sample(&mut self.rng);
        while cluster < end {
            for &detector in &self.detectors {
                let size = self.cluster_size.sample(&mut self.rng) as usize;
                for _ in 0..size {
                    let time = cluster + self.spread.sample(&mut self.rng);
                    if (begin..end).contains(&time) {
                        let digi =
                            random_digi(&mut self.rng, self.parameters.layers, detector, time);
                        storage.entry(detector.storage()).or_default().push(digi);
                    }
                }
            }
            cluster += self.cluster_interval.sample(&mut self.rng);
        }

        if let Some(noise) = self.noise.clone() {
            for &detector in &self.detectors {
                let count = noise.sample(&mut self.rng) as usize;
                for _ in 0..count {
                    let time = self.rng.random_range(begin..end);
                    let digi = random_digi(&mut self.rng, self.parameters.layers, detector, time);
                    storage.entry(detector.storage()).or_default().push(digi);
                }
            }
        }

        let mut timeslice = DigiTimeslice::new(meta);
        for (detector, digis) in storage {
            timeslice.insert(detector, digis);
        }
        timeslice
    }
}

fn invalid<E>(name: &'static str, value: f64) -> impl FnOnce(E) -> SimulationError {
    move |_| SimulationError::InvalidParameter { name, value }
}

fn random_digi(rng: &mut StdRng, layers: u32, detector: DetectorId, time: Time) -> Digi {
    let layer = rng.random_range(0..layers.max(1));
    let channel = rng.random_range(0..=0xFFFF);
    let mut address: ChannelAddress = (layer << LAYER_SHIFT) | channel;
    if detector == DetectorId::Trd2d {
        address |= TRD_2D_FLAG;
    }
    Digi::new(time, address, rng.random())
}

/// Sends every planned timeslice, followed by the end-of-stream command.
#[tracing::instrument(skip_all, level = "debug")]
pub(crate) async fn run_simulator(
    mut simulator: Simulator,
    data: mpsc::Sender<DigiTimeslice>,
    missing: mpsc::Sender<Vec<TimesliceIndex>>,
    control: mpsc::Sender<String>,
) {
    let interval = Duration::from_millis(simulator.parameters.timeslice_interval_ms);
    let plan = simulator.plan();

    for delivery in &plan {
        match *delivery {
            Delivery::Full(index) => {
                let timeslice = simulator.timeslice(index);
                debug!("Sending timeslice {index} with {} digis", timeslice.num_digis());
                if data.send(timeslice).await.is_err() {
                    warn!("Data channel closed, stopping simulation");
                    return;
                }
            }
            Delivery::Missing(index) => {
                debug!("Reporting timeslice {index} as missing");
                if missing.send(vec![index]).await.is_err() {
                    warn!("Missing-index channel closed, stopping simulation");
                    return;
                }
            }
        }
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    if let Some(last_index) = plan.iter().map(Delivery::index).max() {
        let eof = ControlCommand::Eof {
            last_index,
            total_count: plan.len() as u64,
        };
        info!("Simulation done, sending {eof}");
        if control.send(eof.to_string()).await.is_err() {
            warn!("Control channel closed before end of stream");
        }
    }
}

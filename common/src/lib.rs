mod detector;
mod digi;
mod event;
pub mod metrics;
pub mod tracer;

pub use detector::{DetectorId, LAYER_MASK, LAYER_SHIFT, TRD_2D_FLAG};
pub use digi::{Digi, DigiTimeslice, TimesliceMeta};
pub use event::{DigiEvent, Slice};

/// Nanoseconds since the start of the run.
pub type Time = f64;
pub type TimesliceIndex = u64;
pub type ChannelAddress = u32;
pub type EventNumber = u64;
pub type LayerId = u32;

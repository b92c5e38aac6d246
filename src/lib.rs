//! Loss based bandwidth estimation for real-time media congestion control.
//!
//! The estimator ingests per-packet delivery feedback, aggregates it into
//! fixed-duration observations, and fits a probabilistic model that separates
//! the link's inherent loss from congestion loss. A small set of bandwidth
//! candidates is scored against the observation window with a Newton-refined
//! likelihood objective; the winner is clamped by TCP-fairness and
//! acked-rate bounds before being published together with a state
//! (`Increasing`, `DelayBasedEstimate`, `Decreasing`) that the surrounding
//! congestion controller can feed into probing and pacing decisions.
//!
//! The crate is a pure in-memory transform: no I/O, no timers, no global
//! state. Identical inputs produce identical outputs, and multiple estimator
//! instances can coexist.
//!
//! ```
//! use std::time::{Duration, Instant};
//! use loss_bwe::{Bitrate, Config, LossBasedBwe, PacketFeedback};
//!
//! let mut estimator = LossBasedBwe::new(Config::default());
//! estimator.set_bandwidth_estimate(Bitrate::from_kbps(600));
//!
//! let mut now = Instant::now();
//! for _ in 0..3 {
//!     let feedback = [
//!         PacketFeedback {
//!             send_time: now,
//!             receive_time: Some(now + Duration::from_millis(250)),
//!             size: 15_000,
//!         },
//!         PacketFeedback {
//!             send_time: now + Duration::from_millis(250),
//!             receive_time: Some(now + Duration::from_millis(500)),
//!             size: 15_000,
//!         },
//!     ];
//!     estimator.update_bandwidth_estimate(&feedback, Bitrate::Infinite, false);
//!     now += Duration::from_millis(500);
//! }
//!
//! assert!(estimator.is_ready());
//! assert!(estimator.loss_based_result().bandwidth_estimate.is_finite());
//! ```

mod config;
mod constants;
mod estimator;
mod metrics;
mod objective;
mod observation;
mod rate;

#[cfg(test)]
mod test_util;

pub use config::{Config, ConfigMap, ConfigSource, CONFIG_GROUP};
pub use estimator::{LossBasedBwe, LossBasedResult, LossBasedState};
pub use observation::PacketFeedback;
pub use rate::Bitrate;

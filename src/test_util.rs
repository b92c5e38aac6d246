use std::time::{Duration, Instant};

use crate::config::{Config, ConfigMap};
use crate::observation::PacketFeedback;

pub const OBSERVATION_DURATION_LOWER_BOUND: Duration = Duration::from_millis(250);
pub const DELAYED_INCREASE_WINDOW: Duration = Duration::from_millis(300);

pub fn setup_test_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    let _ = tracing_subscriber::fmt::try_init();
}

pub fn config_from(group: &str) -> Config {
    Config::from_source(&ConfigMap::new(&format!("LossBwe/{group}/")))
}

/// The fully tuned configuration most scenarios run with. `valid: false`
/// injects a rampup factor that fails validation.
pub fn scenario_config(enabled: bool, valid: bool) -> Config {
    config_from(&format!(
        "Enabled:{enabled},BwRampupUpperBoundFactor:{},\
         CandidateFactors:1.1|1.0|0.95,HigherBwBiasFactor:0.01,\
         InherentLossLowerBound:0.001,InherentLossUpperBoundBwBalance:14kbps,\
         InherentLossUpperBoundOffset:0.9,InitialInherentLossEstimate:0.01,\
         NewtonIterations:2,NewtonStepSize:0.4,ObservationWindowSize:15,\
         SendingRateSmoothingFactor:0.01,InstantUpperBoundTemporalWeightFactor:0.97,\
         InstantUpperBoundBwBalance:90kbps,InstantUpperBoundLossOffset:0.1,\
         TemporalWeightFactor:0.98,MinNumObservations:1,\
         ObservationDurationLowerBound:{}ms,MaxIncreaseFactor:1.5,\
         DelayedIncreaseWindow:{}ms",
        if valid { "1.2" } else { "0.0" },
        OBSERVATION_DURATION_LOWER_BOUND.as_millis(),
        DELAYED_INCREASE_WINDOW.as_millis(),
    ))
}

/// A two-slot window that is ready after a single observation.
pub fn short_observation_config(custom: &str) -> Config {
    config_from(&format!(
        "MinNumObservations:1,ObservationWindowSize:2,{custom}"
    ))
}

/// Two 15kB packets, both delivered, spanning one observation duration.
pub fn feedback_received(first_send_time: Instant) -> Vec<PacketFeedback> {
    vec![
        PacketFeedback {
            send_time: first_send_time,
            receive_time: Some(first_send_time + OBSERVATION_DURATION_LOWER_BOUND),
            size: 15_000,
        },
        PacketFeedback {
            send_time: first_send_time + OBSERVATION_DURATION_LOWER_BOUND,
            receive_time: Some(first_send_time + 2 * OBSERVATION_DURATION_LOWER_BOUND),
            size: 15_000,
        },
    ]
}

/// Ten 15kB packets, the last one lost.
pub fn feedback_10p_loss(first_send_time: Instant) -> Vec<PacketFeedback> {
    (0..10u32)
        .map(|i| {
            let send_time = first_send_time + i * OBSERVATION_DURATION_LOWER_BOUND;
            PacketFeedback {
                send_time,
                receive_time: (i != 9).then(|| send_time + OBSERVATION_DURATION_LOWER_BOUND),
                size: 15_000,
            }
        })
        .collect()
}

/// Two 15kB packets, the second one lost.
pub fn feedback_50p_loss(first_send_time: Instant) -> Vec<PacketFeedback> {
    vec![
        PacketFeedback {
            send_time: first_send_time,
            receive_time: Some(first_send_time + OBSERVATION_DURATION_LOWER_BOUND),
            size: 15_000,
        },
        PacketFeedback {
            send_time: first_send_time + OBSERVATION_DURATION_LOWER_BOUND,
            receive_time: None,
            size: 15_000,
        },
    ]
}

/// Two 15kB packets, both lost.
pub fn feedback_100p_loss(first_send_time: Instant) -> Vec<PacketFeedback> {
    vec![
        PacketFeedback {
            send_time: first_send_time,
            receive_time: None,
            size: 15_000,
        },
        PacketFeedback {
            send_time: first_send_time + OBSERVATION_DURATION_LOWER_BOUND,
            receive_time: None,
            size: 15_000,
        },
    ]
}

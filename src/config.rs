use std::collections::HashMap;
use std::time::Duration;

use anyhow::{ensure, Result};
use tracing::{debug, warn};

use crate::rate::Bitrate;

/// Name of the config group the estimator reads its options from.
pub const CONFIG_GROUP: &str = "LossBwe";

/// Capability for looking up raw `Key:Value,...` groups by name.
///
/// The estimator never parses the outer config format itself; embedders that
/// already have a settings registry only need to implement this.
pub trait ConfigSource {
    fn lookup(&self, key: &str) -> Option<&str>;
}

/// A flat config string of the form `Name/Key:Value(,Key:Value)*/...`,
/// e.g. `LossBwe/Enabled:true,ObservationWindowSize:15/`.
#[derive(Debug, Default, Clone)]
pub struct ConfigMap {
    groups: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new(raw: &str) -> Self {
        let mut groups = HashMap::new();
        let mut parts = raw.split('/');
        while let Some(name) = parts.next() {
            if name.is_empty() {
                continue;
            }
            let Some(body) = parts.next() else {
                warn!(group = name, "config group without a terminating '/'");
                break;
            };
            groups.insert(name.to_owned(), body.to_owned());
        }
        Self { groups }
    }
}

impl ConfigSource for ConfigMap {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.groups.get(key).map(String::as_str)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("empty value")]
    Empty,
    #[error("invalid boolean {0:?}")]
    InvalidBool(String),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("negative value {0:?}")]
    Negative(String),
}

fn parse_bool(value: &str) -> Result<bool, ParseError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ParseError::InvalidBool(other.to_owned())),
    }
}

fn parse_f64(value: &str) -> Result<f64, ParseError> {
    value
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidNumber(value.to_owned()))
}

fn parse_usize(value: &str) -> Result<usize, ParseError> {
    value
        .parse::<usize>()
        .map_err(|_| ParseError::InvalidNumber(value.to_owned()))
}

/// `250ms`, `60s`, or a bare number of milliseconds.
fn parse_duration(value: &str) -> Result<Duration, ParseError> {
    if value.is_empty() {
        return Err(ParseError::Empty);
    }
    let (number, scale_to_ms) = if let Some(number) = value.strip_suffix("ms") {
        (number, 1.0)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, 1000.0)
    } else {
        (value, 1.0)
    };
    let ms = parse_f64(number)? * scale_to_ms;
    if ms < 0.0 {
        return Err(ParseError::Negative(value.to_owned()));
    }
    Ok(Duration::from_secs_f64(ms / 1000.0))
}

/// `75kbps`, `1000bps`, or a bare number of kilobits per second.
fn parse_bitrate(value: &str) -> Result<Bitrate, ParseError> {
    if value.is_empty() {
        return Err(ParseError::Empty);
    }
    let (number, scale_to_bps) = if let Some(number) = value.strip_suffix("kbps") {
        (number, 1000.0)
    } else if let Some(number) = value.strip_suffix("bps") {
        (number, 1.0)
    } else {
        (value, 1000.0)
    };
    let bps = parse_f64(number)? * scale_to_bps;
    if bps < 0.0 {
        return Err(ParseError::Negative(value.to_owned()));
    }
    Ok(Bitrate::from_bps_f64(bps))
}

/// `1.02|1.0|0.95`
fn parse_factor_list(value: &str) -> Result<Vec<f64>, ParseError> {
    value.split('|').map(parse_f64).collect()
}

fn apply<T>(slot: &mut T, parsed: Result<T, ParseError>, key: &str) {
    match parsed {
        Ok(value) => *slot = value,
        Err(err) => warn!(key, %err, "ignoring malformed config value"),
    }
}

/// Tuning parameters of the estimator. Immutable once the estimator is
/// constructed; a combination that violates any constraint in
/// [`Config::validate`] disables the estimator permanently.
#[derive(Debug, Clone)]
pub struct Config {
    pub enabled: bool,
    pub bandwidth_rampup_upper_bound_factor: f64,
    pub rampup_acceleration_max_factor: f64,
    pub rampup_acceleration_maxout_time: Duration,
    pub candidate_factors: Vec<f64>,
    pub higher_bandwidth_bias_factor: f64,
    pub higher_log_bandwidth_bias_factor: f64,
    pub inherent_loss_lower_bound: f64,
    pub loss_threshold_of_high_bandwidth_preference: f64,
    pub bandwidth_preference_smoothing_factor: f64,
    pub inherent_loss_upper_bound_bandwidth_balance: Bitrate,
    pub inherent_loss_upper_bound_offset: f64,
    pub initial_inherent_loss_estimate: f64,
    pub newton_iterations: usize,
    pub newton_step_size: f64,
    pub append_acknowledged_rate_candidate: bool,
    pub append_delay_based_estimate_candidate: bool,
    pub append_upper_bound_candidate_in_alr: bool,
    pub observation_duration_lower_bound: Duration,
    pub observation_window_size: usize,
    pub sending_rate_smoothing_factor: f64,
    pub instant_upper_bound_temporal_weight_factor: f64,
    pub instant_upper_bound_bandwidth_balance: Bitrate,
    pub instant_upper_bound_loss_offset: f64,
    pub temporal_weight_factor: f64,
    pub bandwidth_backoff_lower_bound_factor: f64,
    pub max_increase_factor: f64,
    pub delayed_increase_window: Duration,
    pub high_loss_rate_threshold: f64,
    pub bandwidth_cap_at_high_loss_rate: Bitrate,
    pub slope_of_bwe_high_loss_function: Bitrate,
    pub not_increase_if_inherent_loss_less_than_average_loss: bool,
    pub not_use_acked_rate_in_alr: bool,
    pub use_in_start_phase: bool,
    pub min_num_observations: usize,
    pub lower_bound_by_acked_rate_factor: f64,
    pub hold_duration_factor: f64,
    pub padding_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            bandwidth_rampup_upper_bound_factor: 1_000_000.0,
            rampup_acceleration_max_factor: 0.0,
            rampup_acceleration_maxout_time: Duration::from_secs(60),
            candidate_factors: vec![1.02, 1.0, 0.95],
            higher_bandwidth_bias_factor: 0.0002,
            higher_log_bandwidth_bias_factor: 0.02,
            inherent_loss_lower_bound: 1.0e-3,
            loss_threshold_of_high_bandwidth_preference: 0.15,
            bandwidth_preference_smoothing_factor: 0.002,
            inherent_loss_upper_bound_bandwidth_balance: Bitrate::from_kbps(75),
            inherent_loss_upper_bound_offset: 0.05,
            initial_inherent_loss_estimate: 0.01,
            newton_iterations: 1,
            newton_step_size: 0.75,
            append_acknowledged_rate_candidate: true,
            append_delay_based_estimate_candidate: true,
            append_upper_bound_candidate_in_alr: false,
            observation_duration_lower_bound: Duration::from_millis(250),
            observation_window_size: 20,
            sending_rate_smoothing_factor: 0.0,
            instant_upper_bound_temporal_weight_factor: 0.9,
            instant_upper_bound_bandwidth_balance: Bitrate::from_kbps(75),
            instant_upper_bound_loss_offset: 0.05,
            temporal_weight_factor: 0.9,
            bandwidth_backoff_lower_bound_factor: 1.0,
            max_increase_factor: 1.3,
            delayed_increase_window: Duration::from_millis(300),
            high_loss_rate_threshold: 1.0,
            bandwidth_cap_at_high_loss_rate: Bitrate::from_kbps(500),
            slope_of_bwe_high_loss_function: Bitrate::from_kbps(1000),
            not_increase_if_inherent_loss_less_than_average_loss: true,
            not_use_acked_rate_in_alr: true,
            use_in_start_phase: false,
            min_num_observations: 3,
            lower_bound_by_acked_rate_factor: 0.0,
            hold_duration_factor: 0.0,
            padding_duration: Duration::ZERO,
        }
    }
}

impl Config {
    /// Reads the `LossBwe` group from `source`. Unknown keys are ignored and
    /// malformed values keep their defaults; constraint checking happens
    /// separately in [`Config::validate`].
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let mut config = Config::default();
        let Some(group) = source.lookup(CONFIG_GROUP) else {
            return config;
        };

        for field in group.split(',') {
            if field.is_empty() {
                continue;
            }
            let Some((key, value)) = field.split_once(':') else {
                warn!(field, "config field is not Key:Value");
                continue;
            };
            match key {
                "Enabled" => apply(&mut config.enabled, parse_bool(value), key),
                "BwRampupUpperBoundFactor" => apply(
                    &mut config.bandwidth_rampup_upper_bound_factor,
                    parse_f64(value),
                    key,
                ),
                "BwRampupAccelMaxFactor" => apply(
                    &mut config.rampup_acceleration_max_factor,
                    parse_f64(value),
                    key,
                ),
                "BwRampupAccelMaxoutTime" => apply(
                    &mut config.rampup_acceleration_maxout_time,
                    parse_duration(value),
                    key,
                ),
                "CandidateFactors" => {
                    apply(&mut config.candidate_factors, parse_factor_list(value), key)
                }
                "HigherBwBiasFactor" => apply(
                    &mut config.higher_bandwidth_bias_factor,
                    parse_f64(value),
                    key,
                ),
                "HigherLogBwBiasFactor" => apply(
                    &mut config.higher_log_bandwidth_bias_factor,
                    parse_f64(value),
                    key,
                ),
                "InherentLossLowerBound" => {
                    apply(&mut config.inherent_loss_lower_bound, parse_f64(value), key)
                }
                "LossThresholdOfHighBandwidthPreference" => apply(
                    &mut config.loss_threshold_of_high_bandwidth_preference,
                    parse_f64(value),
                    key,
                ),
                "BandwidthPreferenceSmoothingFactor" => apply(
                    &mut config.bandwidth_preference_smoothing_factor,
                    parse_f64(value),
                    key,
                ),
                "InherentLossUpperBoundBwBalance" => apply(
                    &mut config.inherent_loss_upper_bound_bandwidth_balance,
                    parse_bitrate(value),
                    key,
                ),
                "InherentLossUpperBoundOffset" => apply(
                    &mut config.inherent_loss_upper_bound_offset,
                    parse_f64(value),
                    key,
                ),
                "InitialInherentLossEstimate" => apply(
                    &mut config.initial_inherent_loss_estimate,
                    parse_f64(value),
                    key,
                ),
                "NewtonIterations" => {
                    apply(&mut config.newton_iterations, parse_usize(value), key)
                }
                "NewtonStepSize" => apply(&mut config.newton_step_size, parse_f64(value), key),
                "AckedRateCandidate" => apply(
                    &mut config.append_acknowledged_rate_candidate,
                    parse_bool(value),
                    key,
                ),
                "DelayBasedCandidate" => apply(
                    &mut config.append_delay_based_estimate_candidate,
                    parse_bool(value),
                    key,
                ),
                "UpperBoundCandidateInAlr" => apply(
                    &mut config.append_upper_bound_candidate_in_alr,
                    parse_bool(value),
                    key,
                ),
                "ObservationDurationLowerBound" => apply(
                    &mut config.observation_duration_lower_bound,
                    parse_duration(value),
                    key,
                ),
                "ObservationWindowSize" => {
                    apply(&mut config.observation_window_size, parse_usize(value), key)
                }
                "SendingRateSmoothingFactor" => apply(
                    &mut config.sending_rate_smoothing_factor,
                    parse_f64(value),
                    key,
                ),
                "InstantUpperBoundTemporalWeightFactor" => apply(
                    &mut config.instant_upper_bound_temporal_weight_factor,
                    parse_f64(value),
                    key,
                ),
                "InstantUpperBoundBwBalance" => apply(
                    &mut config.instant_upper_bound_bandwidth_balance,
                    parse_bitrate(value),
                    key,
                ),
                "InstantUpperBoundLossOffset" => apply(
                    &mut config.instant_upper_bound_loss_offset,
                    parse_f64(value),
                    key,
                ),
                "TemporalWeightFactor" => {
                    apply(&mut config.temporal_weight_factor, parse_f64(value), key)
                }
                "BwBackoffLowerBoundFactor" => apply(
                    &mut config.bandwidth_backoff_lower_bound_factor,
                    parse_f64(value),
                    key,
                ),
                "MaxIncreaseFactor" => {
                    apply(&mut config.max_increase_factor, parse_f64(value), key)
                }
                "DelayedIncreaseWindow" => apply(
                    &mut config.delayed_increase_window,
                    parse_duration(value),
                    key,
                ),
                "HighLossRateThreshold" => {
                    apply(&mut config.high_loss_rate_threshold, parse_f64(value), key)
                }
                "BandwidthCapAtHighLossRate" => apply(
                    &mut config.bandwidth_cap_at_high_loss_rate,
                    parse_bitrate(value),
                    key,
                ),
                "SlopeOfBweHighLossFunc" => apply(
                    &mut config.slope_of_bwe_high_loss_function,
                    parse_bitrate(value),
                    key,
                ),
                "NotIncreaseIfInherentLossLessThanAverageLoss" => apply(
                    &mut config.not_increase_if_inherent_loss_less_than_average_loss,
                    parse_bool(value),
                    key,
                ),
                "NotUseAckedRateInAlr" => {
                    apply(&mut config.not_use_acked_rate_in_alr, parse_bool(value), key)
                }
                "UseInStartPhase" => apply(&mut config.use_in_start_phase, parse_bool(value), key),
                "MinNumObservations" => {
                    apply(&mut config.min_num_observations, parse_usize(value), key)
                }
                "LowerBoundByAckedRateFactor" => apply(
                    &mut config.lower_bound_by_acked_rate_factor,
                    parse_f64(value),
                    key,
                ),
                "HoldDurationFactor" => {
                    apply(&mut config.hold_duration_factor, parse_f64(value), key)
                }
                "PaddingDuration" => {
                    apply(&mut config.padding_duration, parse_duration(value), key)
                }
                _ => debug!(key, "ignoring unknown config key"),
            }
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.bandwidth_rampup_upper_bound_factor > 1.0,
            "bandwidth rampup upper bound factor must be greater than 1: {}",
            self.bandwidth_rampup_upper_bound_factor
        );
        ensure!(
            self.rampup_acceleration_max_factor >= 0.0,
            "rampup acceleration max factor must be non-negative: {}",
            self.rampup_acceleration_max_factor
        );
        ensure!(
            !self.rampup_acceleration_maxout_time.is_zero(),
            "rampup acceleration maxout time must be above zero"
        );
        for factor in &self.candidate_factors {
            ensure!(
                *factor > 0.0,
                "all candidate factors must be greater than zero: {factor}"
            );
        }
        // The configuration must allow at least one candidate other than the
        // current estimate.
        ensure!(
            self.append_acknowledged_rate_candidate
                || self.append_delay_based_estimate_candidate
                || self.candidate_factors.iter().any(|factor| *factor != 1.0),
            "the configuration cannot generate candidates: specify a candidate factor \
             other than 1.0, or allow the acked rate or delay based estimate as a candidate"
        );
        ensure!(
            self.higher_bandwidth_bias_factor >= 0.0,
            "higher bandwidth bias factor must be non-negative: {}",
            self.higher_bandwidth_bias_factor
        );
        ensure!(
            self.higher_log_bandwidth_bias_factor >= 0.0,
            "higher log bandwidth bias factor must be non-negative: {}",
            self.higher_log_bandwidth_bias_factor
        );
        ensure!(
            (0.0..1.0).contains(&self.inherent_loss_lower_bound),
            "inherent loss lower bound must be in [0, 1): {}",
            self.inherent_loss_lower_bound
        );
        ensure!(
            (0.0..1.0).contains(&self.loss_threshold_of_high_bandwidth_preference),
            "loss threshold of high bandwidth preference must be in [0, 1): {}",
            self.loss_threshold_of_high_bandwidth_preference
        );
        ensure!(
            self.bandwidth_preference_smoothing_factor > 0.0
                && self.bandwidth_preference_smoothing_factor <= 1.0,
            "bandwidth preference smoothing factor must be in (0, 1]: {}",
            self.bandwidth_preference_smoothing_factor
        );
        ensure!(
            self.inherent_loss_upper_bound_bandwidth_balance > Bitrate::ZERO,
            "inherent loss upper bound bandwidth balance must be positive: {}",
            self.inherent_loss_upper_bound_bandwidth_balance
        );
        ensure!(
            self.inherent_loss_upper_bound_offset >= self.inherent_loss_lower_bound
                && self.inherent_loss_upper_bound_offset < 1.0,
            "inherent loss upper bound offset must be in [lower bound, 1): {}",
            self.inherent_loss_upper_bound_offset
        );
        ensure!(
            (0.0..1.0).contains(&self.initial_inherent_loss_estimate),
            "initial inherent loss estimate must be in [0, 1): {}",
            self.initial_inherent_loss_estimate
        );
        ensure!(
            self.newton_iterations > 0,
            "number of Newton iterations must be positive: {}",
            self.newton_iterations
        );
        ensure!(
            self.newton_step_size > 0.0,
            "Newton step size must be positive: {}",
            self.newton_step_size
        );
        ensure!(
            !self.observation_duration_lower_bound.is_zero(),
            "observation duration lower bound must be positive"
        );
        ensure!(
            self.observation_window_size >= 2,
            "observation window size must be at least 2: {}",
            self.observation_window_size
        );
        ensure!(
            (0.0..1.0).contains(&self.sending_rate_smoothing_factor),
            "sending rate smoothing factor must be in [0, 1): {}",
            self.sending_rate_smoothing_factor
        );
        ensure!(
            self.instant_upper_bound_temporal_weight_factor > 0.0
                && self.instant_upper_bound_temporal_weight_factor <= 1.0,
            "instant upper bound temporal weight factor must be in (0, 1]: {}",
            self.instant_upper_bound_temporal_weight_factor
        );
        ensure!(
            self.instant_upper_bound_bandwidth_balance > Bitrate::ZERO,
            "instant upper bound bandwidth balance must be positive: {}",
            self.instant_upper_bound_bandwidth_balance
        );
        ensure!(
            (0.0..1.0).contains(&self.instant_upper_bound_loss_offset),
            "instant upper bound loss offset must be in [0, 1): {}",
            self.instant_upper_bound_loss_offset
        );
        ensure!(
            self.temporal_weight_factor > 0.0 && self.temporal_weight_factor <= 1.0,
            "temporal weight factor must be in (0, 1]: {}",
            self.temporal_weight_factor
        );
        ensure!(
            self.bandwidth_backoff_lower_bound_factor <= 1.0,
            "bandwidth backoff lower bound factor must not be greater than 1: {}",
            self.bandwidth_backoff_lower_bound_factor
        );
        ensure!(
            self.max_increase_factor > 0.0,
            "max increase factor must be positive: {}",
            self.max_increase_factor
        );
        ensure!(
            !self.delayed_increase_window.is_zero(),
            "delayed increase window must be positive"
        );
        ensure!(
            self.high_loss_rate_threshold > 0.0 && self.high_loss_rate_threshold <= 1.0,
            "high loss rate threshold must be in (0, 1]: {}",
            self.high_loss_rate_threshold
        );
        ensure!(
            self.min_num_observations > 0,
            "min number of observations must be positive: {}",
            self.min_num_observations
        );
        ensure!(
            self.lower_bound_by_acked_rate_factor >= 0.0,
            "lower bound by acked rate factor must be non-negative: {}",
            self.lower_bound_by_acked_rate_factor
        );
        ensure!(
            self.hold_duration_factor >= 0.0,
            "hold duration factor must be non-negative: {}",
            self.hold_duration_factor
        );
        Ok(())
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!("invalid estimator config: {err:#}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Config, ConfigMap, ConfigSource};
    use crate::rate::Bitrate;

    fn parse(group: &str) -> Config {
        Config::from_source(&ConfigMap::new(&format!("LossBwe/{group}/")))
    }

    #[test]
    fn test_group_lookup() {
        let map = ConfigMap::new("Other/A:1/LossBwe/Enabled:false/");
        assert_eq!(map.lookup("LossBwe"), Some("Enabled:false"));
        assert_eq!(map.lookup("Other"), Some("A:1"));
        assert_eq!(map.lookup("Missing"), None);
    }

    #[test]
    fn test_defaults_when_group_missing() {
        let config = Config::from_source(&ConfigMap::new(""));
        assert!(config.enabled);
        assert_eq!(config.observation_window_size, 20);
        assert_eq!(config.min_num_observations, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unit_suffixes() {
        let config = parse(
            "ObservationDurationLowerBound:250ms,BwRampupAccelMaxoutTime:60s,\
             InstantUpperBoundBwBalance:90kbps,InherentLossUpperBoundBwBalance:14000bps,\
             DelayedIncreaseWindow:300",
        );
        assert_eq!(
            config.observation_duration_lower_bound,
            Duration::from_millis(250)
        );
        assert_eq!(config.rampup_acceleration_maxout_time, Duration::from_secs(60));
        assert_eq!(
            config.instant_upper_bound_bandwidth_balance,
            Bitrate::from_kbps(90)
        );
        assert_eq!(
            config.inherent_loss_upper_bound_bandwidth_balance,
            Bitrate::from_kbps(14)
        );
        assert_eq!(config.delayed_increase_window, Duration::from_millis(300));
    }

    #[test]
    fn test_candidate_factor_list() {
        let config = parse("CandidateFactors:1.1|1.0|0.95");
        assert_eq!(config.candidate_factors, vec![1.1, 1.0, 0.95]);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = parse("NoSuchKey:42,Enabled:false");
        assert!(!config.enabled);
    }

    #[test]
    fn test_malformed_value_keeps_default() {
        let config = parse("NewtonIterations:banana,NewtonStepSize:0.4");
        assert_eq!(config.newton_iterations, 1);
        assert_eq!(config.newton_step_size, 0.4);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rampup_factor_must_exceed_one() {
        assert!(parse("BwRampupUpperBoundFactor:0.0").validate().is_err());
        assert!(parse("BwRampupUpperBoundFactor:1.2").validate().is_ok());
    }

    #[test]
    fn test_non_positive_candidate_factor_is_invalid() {
        assert!(parse("CandidateFactors:-1.3|1.1").validate().is_err());
        assert!(parse("CandidateFactors:0.0|1.1").validate().is_err());
    }

    #[test]
    fn test_config_must_allow_generating_candidates() {
        let config = parse("CandidateFactors:1.0,AckedRateCandidate:false,DelayBasedCandidate:false");
        assert!(config.validate().is_err());
        let config = parse("CandidateFactors:1.0,AckedRateCandidate:true,DelayBasedCandidate:false");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_size_lower_bound() {
        assert!(parse("ObservationWindowSize:1").validate().is_err());
        assert!(parse("ObservationWindowSize:2").validate().is_ok());
    }

    #[test]
    fn test_high_loss_rate_threshold_range() {
        assert!(parse("HighLossRateThreshold:0.0").validate().is_err());
        assert!(parse("HighLossRateThreshold:1.5").validate().is_err());
        assert!(parse("HighLossRateThreshold:0.3").validate().is_ok());
    }
}

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::{INITIAL_HOLD_DURATION, MAX_HOLD_DURATION, RECOVERY_WINDOW_MIN_BITRATE};
use crate::metrics::METRICS;
use crate::objective::{ChannelParameters, ObjectiveFunction};
use crate::observation::{ObservationWindow, PacketFeedback};
use crate::rate::Bitrate;

/// Which signal currently limits the estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossBasedState {
    Increasing,
    DelayBasedEstimate,
    Decreasing,
}

/// Snapshot of the estimator output. Returned by value and never aliases
/// internal storage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossBasedResult {
    pub bandwidth_estimate: Bitrate,
    pub state: LossBasedState,
}

#[derive(Debug)]
struct HoldInfo {
    timestamp: Option<Instant>,
    duration: Duration,
    rate: Bitrate,
}

impl Default for HoldInfo {
    fn default() -> Self {
        Self {
            timestamp: None,
            duration: INITIAL_HOLD_DURATION,
            rate: Bitrate::Infinite,
        }
    }
}

#[derive(Debug)]
struct PaddingInfo {
    rate: Bitrate,
    timestamp: Option<Instant>,
}

impl Default for PaddingInfo {
    fn default() -> Self {
        Self {
            rate: Bitrate::ZERO,
            timestamp: None,
        }
    }
}

/// Loss based bandwidth estimator.
///
/// Feeds per-packet delivery feedback through a windowed observation
/// aggregator, evaluates a small set of bandwidth candidates against a
/// probabilistic loss model, and applies the instant/TCP-fair/acked-rate
/// bounds before publishing an estimate and its state.
///
/// Fully self-contained: multiple estimators may coexist and each instance is
/// driven from a single task.
pub struct LossBasedBwe {
    config: Config,
    enabled: bool,
    window: ObservationWindow,
    current_best_estimate: ChannelParameters,
    average_reported_loss_ratio: f64,
    acknowledged_bitrate: Option<Bitrate>,
    delay_based_estimate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    cached_instant_upper_bound: Option<Bitrate>,
    cached_instant_lower_bound: Option<Bitrate>,
    last_time_estimate_reduced: Option<Instant>,
    recovering_after_loss_timestamp: Option<Instant>,
    bandwidth_limit_in_current_window: Bitrate,
    last_hold_info: HoldInfo,
    last_padding_info: PaddingInfo,
    result: LossBasedResult,
}

impl LossBasedBwe {
    pub fn new(config: Config) -> Self {
        let enabled = config.enabled && config.is_valid();
        if config.enabled && !enabled {
            warn!("loss based estimator disabled: configuration rejected");
        }
        let window = ObservationWindow::new(&config);
        let current_best_estimate = ChannelParameters {
            inherent_loss: config.initial_inherent_loss_estimate,
            loss_limited_bandwidth: Bitrate::Infinite,
        };
        Self {
            config,
            enabled,
            window,
            current_best_estimate,
            average_reported_loss_ratio: 0.0,
            acknowledged_bitrate: None,
            delay_based_estimate: Bitrate::Infinite,
            min_bitrate: Bitrate::from_kbps(1),
            max_bitrate: Bitrate::Infinite,
            cached_instant_upper_bound: None,
            cached_instant_lower_bound: None,
            last_time_estimate_reduced: None,
            recovering_after_loss_timestamp: None,
            bandwidth_limit_in_current_window: Bitrate::Infinite,
            last_hold_info: HoldInfo::default(),
            last_padding_info: PaddingInfo::default(),
            result: LossBasedResult {
                bandwidth_estimate: Bitrate::Infinite,
                state: LossBasedState::DelayBasedEstimate,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True once the estimator has been seeded with an estimate and has
    /// closed enough observations to trust its own output.
    pub fn is_ready(&self) -> bool {
        self.enabled
            && self.current_best_estimate.loss_limited_bandwidth.is_finite()
            && self.window.len() >= self.config.min_num_observations as u64
    }

    pub fn ready_to_use_in_start_phase(&self) -> bool {
        self.is_ready() && self.config.use_in_start_phase
    }

    /// The current estimate and state. Until the estimator is ready this
    /// passes the delay based estimate through (or `Infinite` if there is
    /// none).
    pub fn loss_based_result(&self) -> LossBasedResult {
        if !self.is_ready() {
            return LossBasedResult {
                bandwidth_estimate: if self.delay_based_estimate.is_finite() {
                    self.delay_based_estimate
                } else {
                    Bitrate::Infinite
                },
                state: LossBasedState::DelayBasedEstimate,
            };
        }
        self.result
    }

    /// Overrides the current estimate without touching the observation
    /// history. The value persists until an update closes a new observation.
    pub fn set_bandwidth_estimate(&mut self, bandwidth_estimate: Bitrate) {
        if !bandwidth_estimate.is_finite() {
            warn!(%bandwidth_estimate, "ignoring non-finite bandwidth estimate");
            return;
        }
        self.current_best_estimate.loss_limited_bandwidth = bandwidth_estimate;
        self.result = LossBasedResult {
            bandwidth_estimate,
            state: LossBasedState::DelayBasedEstimate,
        };
    }

    pub fn set_acknowledged_bitrate(&mut self, acknowledged_bitrate: Bitrate) {
        if !acknowledged_bitrate.is_finite() {
            warn!(%acknowledged_bitrate, "ignoring non-finite acknowledged bitrate");
            return;
        }
        self.acknowledged_bitrate = Some(acknowledged_bitrate);
        self.calculate_instant_lower_bound();
    }

    /// Hard clamp for all future outputs, applied after every other rule.
    pub fn set_min_max_bitrate(&mut self, min_bitrate: Bitrate, max_bitrate: Bitrate) {
        if min_bitrate.is_finite() {
            self.min_bitrate = min_bitrate;
            self.calculate_instant_lower_bound();
        } else {
            warn!(%min_bitrate, "ignoring non-finite min bitrate");
        }
        if max_bitrate.is_finite() {
            self.max_bitrate = max_bitrate;
        } else {
            warn!(%max_bitrate, "ignoring non-finite max bitrate");
        }
    }

    /// Ingests an ordered feedback batch together with the current delay
    /// based estimate and ALR flag, then recomputes the estimate and state.
    ///
    /// A batch that does not close a new observation leaves the previous
    /// result untouched, so re-ingesting contained or repeated batches is a
    /// no-op.
    pub fn update_bandwidth_estimate(
        &mut self,
        feedback: &[PacketFeedback],
        delay_based_estimate: Bitrate,
        in_alr: bool,
    ) {
        self.delay_based_estimate = delay_based_estimate;
        if !self.enabled {
            return;
        }
        METRICS.feedback_batches.increment(1);
        if feedback.is_empty() {
            debug!("cannot update the estimate without any feedback");
            return;
        }

        if !self.push_back_observation(feedback) {
            return;
        }

        if !self.current_best_estimate.loss_limited_bandwidth.is_finite() {
            if !delay_based_estimate.is_finite() {
                warn!(
                    %delay_based_estimate,
                    "a finite delay based estimate is required to seed the estimator"
                );
                return;
            }
            self.current_best_estimate.loss_limited_bandwidth = delay_based_estimate;
            self.result = LossBasedResult {
                bandwidth_estimate: delay_based_estimate,
                state: LossBasedState::DelayBasedEstimate,
            };
        }

        let mut best_candidate = self.current_best_estimate;
        {
            let objective = ObjectiveFunction::new(
                &self.config,
                &self.window,
                self.average_reported_loss_ratio,
            );
            let mut objective_max = f64::MIN;
            for mut candidate in self.get_candidates(&objective, in_alr) {
                objective.newton_update(&mut candidate);
                let candidate_objective = objective.evaluate(&candidate);
                if candidate_objective > objective_max {
                    objective_max = candidate_objective;
                    best_candidate = candidate;
                }
            }
        }

        if best_candidate.loss_limited_bandwidth
            < self.current_best_estimate.loss_limited_bandwidth
        {
            self.last_time_estimate_reduced = self.window.last_send_time();
        }

        // An increase is only trusted if the model attributes at least the
        // observed average loss to the link itself.
        if self.average_reported_loss_ratio > best_candidate.inherent_loss
            && self.config.not_increase_if_inherent_loss_less_than_average_loss
            && self.current_best_estimate.loss_limited_bandwidth
                < best_candidate.loss_limited_bandwidth
        {
            best_candidate.loss_limited_bandwidth =
                self.current_best_estimate.loss_limited_bandwidth;
        }

        if self.in_loss_limited_state() {
            // Within the delayed-increase window after a backoff, growth is
            // capped at the limit armed when the window started.
            if let (Some(recovering_at), Some(last_send)) = (
                self.recovering_after_loss_timestamp,
                self.window.last_send_time(),
            ) {
                if recovering_at + self.config.delayed_increase_window > last_send
                    && best_candidate.loss_limited_bandwidth
                        > self.bandwidth_limit_in_current_window
                {
                    best_candidate.loss_limited_bandwidth =
                        self.bandwidth_limit_in_current_window;
                }
            }

            let increasing_when_loss_limited = self.is_estimate_increasing_when_loss_limited(
                self.current_best_estimate.loss_limited_bandwidth,
                best_candidate.loss_limited_bandwidth,
            );
            if let Some(acknowledged_bitrate) = self.acknowledged_bitrate {
                if increasing_when_loss_limited {
                    best_candidate.loss_limited_bandwidth =
                        best_candidate.loss_limited_bandwidth.min(
                            acknowledged_bitrate * self.config.bandwidth_rampup_upper_bound_factor,
                        );
                }
            }
        }

        let bounded_bandwidth_estimate = self.instant_lower_bound().max(
            best_candidate
                .loss_limited_bandwidth
                .min(self.instant_upper_bound())
                .min(self.delay_based_estimate),
        );

        self.current_best_estimate = best_candidate;
        if self.config.lower_bound_by_acked_rate_factor > 0.0 {
            self.current_best_estimate.loss_limited_bandwidth = self
                .current_best_estimate
                .loss_limited_bandwidth
                .max(self.instant_lower_bound());
        }

        if self.result.state == LossBasedState::Decreasing
            && self.hold_still_active()
            && bounded_bandwidth_estimate < self.delay_based_estimate
        {
            // The HOLD rate must not undercut the acked-rate floor.
            if self.config.lower_bound_by_acked_rate_factor > 0.0 {
                self.last_hold_info.rate =
                    self.last_hold_info.rate.max(self.instant_lower_bound());
            }
            // Ramping straight back up to a rate that just caused loss is
            // what HOLD exists to prevent.
            self.result.bandwidth_estimate =
                self.last_hold_info.rate.min(bounded_bandwidth_estimate);
            return;
        }

        if self.is_estimate_increasing_when_loss_limited(
            self.result.bandwidth_estimate,
            bounded_bandwidth_estimate,
        ) && self.can_keep_increasing_state(bounded_bandwidth_estimate)
            && bounded_bandwidth_estimate < self.delay_based_estimate
            && bounded_bandwidth_estimate < self.max_bitrate
        {
            if !self.config.padding_duration.is_zero()
                && bounded_bandwidth_estimate > self.last_padding_info.rate
            {
                // Start a new padding interval.
                self.last_padding_info = PaddingInfo {
                    rate: bounded_bandwidth_estimate,
                    timestamp: self.window.last_send_time(),
                };
            }
            self.set_state(LossBasedState::Increasing);
        } else if bounded_bandwidth_estimate < self.delay_based_estimate
            && bounded_bandwidth_estimate < self.max_bitrate
        {
            if self.result.state != LossBasedState::Decreasing {
                METRICS.backoffs.increment(1);
                if self.config.hold_duration_factor > 0.0 {
                    debug!(
                        estimate = %bounded_bandwidth_estimate,
                        duration = ?self.last_hold_info.duration,
                        "entering hold"
                    );
                    METRICS.holds.increment(1);
                    self.last_hold_info = HoldInfo {
                        timestamp: self
                            .window
                            .last_send_time()
                            .map(|last_send| last_send + self.last_hold_info.duration),
                        duration: MAX_HOLD_DURATION.min(
                            self.last_hold_info
                                .duration
                                .mul_f64(self.config.hold_duration_factor),
                        ),
                        rate: bounded_bandwidth_estimate,
                    };
                }
            }
            self.last_padding_info = PaddingInfo::default();
            self.set_state(LossBasedState::Decreasing);
        } else {
            // The delay based estimate is in charge again; drop the HOLD
            // bookkeeping so it cannot pin a future decrease to a stale rate.
            self.last_hold_info = HoldInfo::default();
            self.last_padding_info = PaddingInfo::default();
            self.set_state(LossBasedState::DelayBasedEstimate);
        }
        self.result.bandwidth_estimate = bounded_bandwidth_estimate;

        if self.in_loss_limited_state() {
            let outside_recovery_window = match (
                self.recovering_after_loss_timestamp,
                self.window.last_send_time(),
            ) {
                (Some(recovering_at), Some(last_send)) => {
                    recovering_at + self.config.delayed_increase_window < last_send
                }
                _ => true,
            };
            if outside_recovery_window {
                self.bandwidth_limit_in_current_window = RECOVERY_WINDOW_MIN_BITRATE.max(
                    self.current_best_estimate.loss_limited_bandwidth
                        * self.config.max_increase_factor,
                );
                self.recovering_after_loss_timestamp = self.window.last_send_time();
            }
        }

        if let Bitrate::Finite(bps) = self.result.bandwidth_estimate {
            METRICS.estimate_bps.set(bps as f64);
        }
        METRICS
            .average_loss_ratio
            .set(self.average_reported_loss_ratio);
        METRICS
            .inherent_loss
            .set(self.current_best_estimate.inherent_loss);
    }

    fn set_state(&mut self, state: LossBasedState) {
        if state != self.result.state {
            debug!(from = ?self.result.state, to = ?state, "state change");
        }
        self.result.state = state;
    }

    // Returns false when the batch closed no observation, in which case the
    // previous result stands.
    fn push_back_observation(&mut self, feedback: &[PacketFeedback]) -> bool {
        if !self.window.append(feedback) {
            return false;
        }
        self.average_reported_loss_ratio = self.window.average_reported_loss_ratio();
        self.calculate_instant_upper_bound();
        true
    }

    fn get_candidates(
        &self,
        objective: &ObjectiveFunction<'_>,
        in_alr: bool,
    ) -> Vec<ChannelParameters> {
        let best = self.current_best_estimate;
        let mut bandwidths: Vec<Bitrate> = self
            .config
            .candidate_factors
            .iter()
            .map(|factor| best.loss_limited_bandwidth * *factor)
            .collect();

        if let Some(acknowledged_bitrate) = self.acknowledged_bitrate {
            if self.config.append_acknowledged_rate_candidate
                && (!(self.config.not_use_acked_rate_in_alr && in_alr)
                    || self.padding_interval_active())
            {
                bandwidths
                    .push(acknowledged_bitrate * self.config.bandwidth_backoff_lower_bound_factor);
            }
        }

        if self.delay_based_estimate.is_finite()
            && self.config.append_delay_based_estimate_candidate
            && self.delay_based_estimate > best.loss_limited_bandwidth
        {
            bandwidths.push(self.delay_based_estimate);
        }

        if in_alr
            && self.config.append_upper_bound_candidate_in_alr
            && best.loss_limited_bandwidth > self.instant_upper_bound()
        {
            bandwidths.push(self.instant_upper_bound());
        }

        let candidate_upper_bound = self.candidate_bandwidth_upper_bound();
        bandwidths
            .into_iter()
            .map(|bandwidth| {
                let mut candidate = best;
                candidate.loss_limited_bandwidth =
                    bandwidth.min(best.loss_limited_bandwidth.max(candidate_upper_bound));
                candidate.inherent_loss = objective.feasible_inherent_loss(&candidate);
                candidate
            })
            .collect()
    }

    fn candidate_bandwidth_upper_bound(&self) -> Bitrate {
        let mut upper_bound = self.max_bitrate;
        if self.in_loss_limited_state() && self.bandwidth_limit_in_current_window.is_finite() {
            upper_bound = self.bandwidth_limit_in_current_window;
        }

        let Some(acknowledged_bitrate) = self.acknowledged_bitrate else {
            return upper_bound;
        };
        if self.config.rampup_acceleration_max_factor > 0.0 {
            if let (Some(last_send), Some(reduced_at)) =
                (self.window.last_send_time(), self.last_time_estimate_reduced)
            {
                let since_reduced = last_send
                    .saturating_duration_since(reduced_at)
                    .min(self.config.rampup_acceleration_maxout_time);
                let acceleration = self.config.rampup_acceleration_max_factor
                    * since_reduced.as_secs_f64()
                    / self.config.rampup_acceleration_maxout_time.as_secs_f64();
                upper_bound = upper_bound + acknowledged_bitrate * acceleration;
            }
        }
        upper_bound
    }

    fn instant_upper_bound(&self) -> Bitrate {
        self.cached_instant_upper_bound.unwrap_or(self.max_bitrate)
    }

    fn calculate_instant_upper_bound(&mut self) {
        let mut instant_limit = self.max_bitrate;
        if self.average_reported_loss_ratio > self.config.instant_upper_bound_loss_offset {
            instant_limit = self.config.instant_upper_bound_bandwidth_balance
                / (self.average_reported_loss_ratio - self.config.instant_upper_bound_loss_offset);
            if self.average_reported_loss_ratio > self.config.high_loss_rate_threshold {
                // Past the high loss threshold the cap falls off linearly
                // with the reported loss, down to the configured minimum.
                let high_loss_limit = Bitrate::from_bps_f64(
                    self.config.bandwidth_cap_at_high_loss_rate.as_f64()
                        - self.config.slope_of_bwe_high_loss_function.as_f64()
                            * self.average_reported_loss_ratio,
                );
                instant_limit = instant_limit.min(high_loss_limit.max(self.min_bitrate));
            }
        }
        self.cached_instant_upper_bound = Some(instant_limit);
    }

    fn instant_lower_bound(&self) -> Bitrate {
        self.cached_instant_lower_bound.unwrap_or(Bitrate::ZERO)
    }

    fn calculate_instant_lower_bound(&mut self) {
        let mut instant_lower_bound = Bitrate::ZERO;
        if let Some(acknowledged_bitrate) = self.acknowledged_bitrate {
            if self.config.lower_bound_by_acked_rate_factor > 0.0 {
                instant_lower_bound =
                    acknowledged_bitrate * self.config.lower_bound_by_acked_rate_factor;
            }
        }
        if self.min_bitrate.is_finite() {
            instant_lower_bound = instant_lower_bound.max(self.min_bitrate);
        }
        self.cached_instant_lower_bound = Some(instant_lower_bound);
    }

    fn is_estimate_increasing_when_loss_limited(
        &self,
        old_estimate: Bitrate,
        new_estimate: Bitrate,
    ) -> bool {
        (old_estimate < new_estimate
            || (old_estimate == new_estimate
                && self.result.state == LossBasedState::Increasing))
            && self.in_loss_limited_state()
    }

    fn in_loss_limited_state(&self) -> bool {
        self.result.state != LossBasedState::DelayBasedEstimate
    }

    fn can_keep_increasing_state(&self, estimate: Bitrate) -> bool {
        if self.config.padding_duration.is_zero()
            || self.result.state != LossBasedState::Increasing
        {
            return true;
        }
        // Stay in the increasing state while the padding interval runs or the
        // estimate keeps growing.
        self.padding_interval_active() || self.last_padding_info.rate < estimate
    }

    fn padding_interval_active(&self) -> bool {
        if self.config.padding_duration.is_zero() {
            return false;
        }
        match (self.last_padding_info.timestamp, self.window.last_send_time()) {
            (Some(padded_at), Some(last_send)) => {
                padded_at + self.config.padding_duration >= last_send
            }
            _ => false,
        }
    }

    fn hold_still_active(&self) -> bool {
        match (self.last_hold_info.timestamp, self.window.last_send_time()) {
            (Some(hold_until), Some(last_send)) => hold_until > last_send,
            _ => false,
        }
    }
}

use crate::config::Config;
use crate::observation::ObservationWindow;
use crate::rate::Bitrate;

/// A hypothesis about the channel: a capacity candidate together with the
/// loss the link would exhibit even without congestion.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelParameters {
    pub inherent_loss: f64,
    pub loss_limited_bandwidth: Bitrate,
}

#[derive(Debug, Default, Clone, Copy)]
struct Derivatives {
    first: f64,
    second: f64,
}

/// Per-update evaluator of the candidate objective: a temporally weighted
/// log-likelihood of the observed packet outcomes under a candidate, plus a
/// bias that prefers higher bandwidth while the reported loss stays under the
/// configured threshold (and lower bandwidth above it).
pub(crate) struct ObjectiveFunction<'a> {
    config: &'a Config,
    window: &'a ObservationWindow,
    average_reported_loss_ratio: f64,
}

impl<'a> ObjectiveFunction<'a> {
    pub fn new(
        config: &'a Config,
        window: &'a ObservationWindow,
        average_reported_loss_ratio: f64,
    ) -> Self {
        Self {
            config,
            window,
            average_reported_loss_ratio,
        }
    }

    /// Runs the configured number of damped Newton steps on the inherent loss
    /// of `params`, staying inside its feasible range.
    pub fn newton_update(&self, params: &mut ChannelParameters) {
        if self.window.len() == 0 {
            return;
        }
        for _ in 0..self.config.newton_iterations {
            let derivatives = self.derivatives(params);
            params.inherent_loss -=
                self.config.newton_step_size * derivatives.first / derivatives.second;
            params.inherent_loss = self.feasible_inherent_loss(params);
        }
    }

    fn derivatives(&self, params: &ChannelParameters) -> Derivatives {
        let mut derivatives = Derivatives::default();
        for (observation, weight) in self.window.weighted() {
            let loss_probability = loss_probability(
                params.inherent_loss,
                params.loss_limited_bandwidth,
                observation.sending_rate,
            );
            let lost = observation.num_lost_packets as f64;
            let received = observation.num_received_packets() as f64;
            derivatives.first +=
                weight * (lost / loss_probability - received / (1.0 - loss_probability));
            derivatives.second -= weight
                * (lost / loss_probability.powi(2)
                    + received / (1.0 - loss_probability).powi(2));
        }
        // Mathematically non-positive, and zero only over an empty window;
        // keep the Newton denominator usable regardless.
        if derivatives.second >= 0.0 {
            derivatives.second = -1.0e-6;
        }
        derivatives
    }

    pub fn evaluate(&self, params: &ChannelParameters) -> f64 {
        let mut objective = 0.0;
        let high_bandwidth_bias = self.high_bandwidth_bias(params.loss_limited_bandwidth);
        for (observation, weight) in self.window.weighted() {
            let loss_probability = loss_probability(
                params.inherent_loss,
                params.loss_limited_bandwidth,
                observation.sending_rate,
            );
            let lost = observation.num_lost_packets as f64;
            let received = observation.num_received_packets() as f64;
            objective += weight
                * (lost * loss_probability.ln() + received * (1.0 - loss_probability).ln());
            objective += weight * high_bandwidth_bias * observation.num_packets as f64;
        }
        objective
    }

    /// Clamps the inherent loss of `params` into
    /// `[lower_bound, upper_bound(bandwidth)]`.
    pub fn feasible_inherent_loss(&self, params: &ChannelParameters) -> f64 {
        params
            .inherent_loss
            .max(self.config.inherent_loss_lower_bound)
            .min(self.inherent_loss_upper_bound(params.loss_limited_bandwidth))
    }

    fn inherent_loss_upper_bound(&self, bandwidth: Bitrate) -> f64 {
        if bandwidth.is_zero() {
            return 1.0;
        }
        let upper_bound = self.config.inherent_loss_upper_bound_offset
            + self.config.inherent_loss_upper_bound_bandwidth_balance / bandwidth;
        upper_bound.min(1.0)
    }

    fn high_bandwidth_bias(&self, bandwidth: Bitrate) -> f64 {
        if !bandwidth.is_finite() {
            return 0.0;
        }
        let kbps = bandwidth.kbps_f64();
        self.adjusted_bias_factor(self.config.higher_bandwidth_bias_factor) * kbps
            + self.adjusted_bias_factor(self.config.higher_log_bandwidth_bias_factor)
                * (1.0 + kbps).ln()
    }

    // Scales a bias factor by how far the reported loss sits below the
    // high-bandwidth-preference threshold; flips sign above it.
    fn adjusted_bias_factor(&self, bias_factor: f64) -> f64 {
        let margin = self.config.loss_threshold_of_high_bandwidth_preference
            - self.average_reported_loss_ratio;
        bias_factor * margin / (self.config.bandwidth_preference_smoothing_factor + margin.abs())
    }
}

/// Probability of losing a packet when pushing `sending_rate` through a link
/// of capacity `bandwidth` with the given inherent loss: the inherent part
/// plus the congestion overshoot, ε-clamped so logarithms stay finite.
pub(crate) fn loss_probability(
    inherent_loss: f64,
    bandwidth: Bitrate,
    sending_rate: Bitrate,
) -> f64 {
    let inherent_loss = inherent_loss.clamp(0.0, 1.0);
    let mut loss_probability = inherent_loss;
    if sending_rate.is_finite() && bandwidth.is_finite() && sending_rate > bandwidth {
        let overshoot = (sending_rate.as_f64() - bandwidth.as_f64()) / sending_rate.as_f64();
        loss_probability += (1.0 - inherent_loss) * overshoot;
    }
    loss_probability.clamp(1.0e-6, 1.0 - 1.0e-6)
}

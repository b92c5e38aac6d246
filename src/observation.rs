use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::Config;
use crate::metrics::METRICS;
use crate::rate::Bitrate;

/// Delivery feedback for one sent packet. A missing receive time means the
/// packet was reported lost.
#[derive(Debug, Clone, Copy)]
pub struct PacketFeedback {
    pub send_time: Instant,
    pub receive_time: Option<Instant>,
    /// Sent size in bytes.
    pub size: usize,
}

impl PacketFeedback {
    pub fn is_lost(&self) -> bool {
        self.receive_time.is_none()
    }
}

/// A closed, immutable aggregate of packet outcomes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Observation {
    pub id: u64,
    pub num_packets: usize,
    pub num_lost_packets: usize,
    /// Total bytes covered by this observation.
    pub size: usize,
    /// EMA-smoothed sending rate over the observation span.
    pub sending_rate: Bitrate,
}

impl Observation {
    pub fn num_received_packets(&self) -> usize {
        self.num_packets - self.num_lost_packets
    }
}

#[derive(Debug, Default)]
struct PartialObservation {
    num_packets: usize,
    num_lost_packets: usize,
    size: usize,
}

/// Fixed-capacity history of observations plus the still-open partial one.
///
/// Feedback batches accumulate into the partial observation until the maximum
/// send time advances past the previous close by at least the configured
/// lower bound; only then is an observation closed and pushed into the ring,
/// overwriting the oldest entry. Temporal weights are precomputed per slot
/// distance so the optimizer never recomputes powers on the hot path.
pub(crate) struct ObservationWindow {
    duration_lower_bound: Duration,
    sending_rate_smoothing_factor: f64,
    observations: Vec<Option<Observation>>,
    partial: PartialObservation,
    num_observations: u64,
    last_send_time: Option<Instant>,
    temporal_weights: Vec<f64>,
    instant_temporal_weights: Vec<f64>,
}

impl ObservationWindow {
    pub fn new(config: &Config) -> Self {
        let size = config.observation_window_size;
        Self {
            duration_lower_bound: config.observation_duration_lower_bound,
            sending_rate_smoothing_factor: config.sending_rate_smoothing_factor,
            observations: vec![None; size],
            partial: PartialObservation::default(),
            num_observations: 0,
            last_send_time: None,
            temporal_weights: (0..size)
                .map(|i| config.temporal_weight_factor.powi(i as i32))
                .collect(),
            instant_temporal_weights: (0..size)
                .map(|i| {
                    config
                        .instant_upper_bound_temporal_weight_factor
                        .powi(i as i32)
                })
                .collect(),
        }
    }

    /// Total number of observations ever closed.
    pub fn len(&self) -> u64 {
        self.num_observations
    }

    /// Send-time high-water mark of the most recent close (seeded by the
    /// first packet of the first batch).
    pub fn last_send_time(&self) -> Option<Instant> {
        self.last_send_time
    }

    /// Folds `batch` into the open partial observation, closing it when the
    /// span since the previous close reaches the lower bound. Returns whether
    /// an observation was closed.
    pub fn append(&mut self, batch: &[PacketFeedback]) -> bool {
        let mut first_send_time: Option<Instant> = None;
        let mut last_send_time: Option<Instant> = None;
        for packet in batch {
            self.partial.num_packets += 1;
            self.partial.size += packet.size;
            if packet.is_lost() {
                self.partial.num_lost_packets += 1;
            }
            first_send_time = Some(match first_send_time {
                Some(t) => t.min(packet.send_time),
                None => packet.send_time,
            });
            last_send_time = Some(match last_send_time {
                Some(t) => t.max(packet.send_time),
                None => packet.send_time,
            });
        }
        let (Some(first_send_time), Some(last_send_time)) = (first_send_time, last_send_time)
        else {
            return false;
        };

        let anchor = *self.last_send_time.get_or_insert(first_send_time);
        let span = match last_send_time.checked_duration_since(anchor) {
            Some(span) if !span.is_zero() && span >= self.duration_lower_bound => span,
            // Too little has happened since the last close to be meaningful.
            _ => return false,
        };
        self.last_send_time = Some(last_send_time);

        let sending_rate =
            self.smoothed_sending_rate(Bitrate::from_bytes_per(self.partial.size, span));
        let id = self.num_observations;
        self.num_observations += 1;
        let observation = Observation {
            id,
            num_packets: self.partial.num_packets,
            num_lost_packets: self.partial.num_lost_packets,
            size: self.partial.size,
            sending_rate,
        };
        debug!(
            id,
            packets = observation.num_packets,
            lost = observation.num_lost_packets,
            bytes = observation.size,
            rate = %sending_rate,
            "closed observation"
        );
        METRICS.observations.increment(1);
        METRICS.observation_span_ms.record(span.as_secs_f64() * 1000.0);

        let slot = (id % self.observations.len() as u64) as usize;
        self.observations[slot] = Some(observation);
        self.partial = PartialObservation::default();
        true
    }

    fn smoothed_sending_rate(&self, instantaneous: Bitrate) -> Bitrate {
        let Some(previous) = self.newest().map(|observation| observation.sending_rate) else {
            return instantaneous;
        };
        let alpha = self.sending_rate_smoothing_factor;
        previous * alpha + instantaneous * (1.0 - alpha)
    }

    fn newest(&self) -> Option<&Observation> {
        if self.num_observations == 0 {
            return None;
        }
        let slot = ((self.num_observations - 1) % self.observations.len() as u64) as usize;
        self.observations[slot].as_ref()
    }

    /// Live observations paired with their temporal weight (newest first by
    /// weight, 1.0 for the newest id).
    pub fn weighted(&self) -> impl Iterator<Item = (&Observation, f64)> + '_ {
        let newest_id = self.num_observations.saturating_sub(1);
        self.observations.iter().flatten().map(move |observation| {
            (
                observation,
                self.temporal_weights[(newest_id - observation.id) as usize],
            )
        })
    }

    /// Loss ratio over the window, weighted with the instant-upper-bound
    /// temporal weights. Zero until the first observation closes.
    pub fn average_reported_loss_ratio(&self) -> f64 {
        if self.num_observations == 0 {
            return 0.0;
        }
        let newest_id = self.num_observations - 1;
        let mut num_packets = 0.0;
        let mut num_lost_packets = 0.0;
        for observation in self.observations.iter().flatten() {
            let weight = self.instant_temporal_weights[(newest_id - observation.id) as usize];
            num_packets += weight * observation.num_packets as f64;
            num_lost_packets += weight * observation.num_lost_packets as f64;
        }
        if num_packets == 0.0 {
            return 0.0;
        }
        num_lost_packets / num_packets
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use approx::assert_abs_diff_eq;

    use super::ObservationWindow;
    use crate::config::Config;
    use crate::rate::Bitrate;
    use crate::test_util::{feedback_received, OBSERVATION_DURATION_LOWER_BOUND};

    fn window() -> ObservationWindow {
        ObservationWindow::new(&Config::default())
    }

    #[test]
    fn test_empty_batch_is_a_noop() {
        let mut window = window();
        assert!(!window.append(&[]));
        assert_eq!(window.len(), 0);
        assert!(window.last_send_time().is_none());
    }

    #[test]
    fn test_closes_once_span_reaches_lower_bound() {
        let mut window = window();
        let start = Instant::now();
        assert!(window.append(&feedback_received(start)));
        assert_eq!(window.len(), 1);
        assert_eq!(
            window.last_send_time(),
            Some(start + OBSERVATION_DURATION_LOWER_BOUND)
        );
    }

    #[test]
    fn test_short_batch_keeps_accumulating() {
        let mut window = window();
        let start = Instant::now();
        assert!(window.append(&feedback_received(start)));

        // Contained entirely within the lower bound of the open observation.
        let contained = feedback_received(start + Duration::from_millis(1));
        assert!(!window.append(&contained));
        assert_eq!(window.len(), 1);

        // The next batch that crosses the boundary closes everything
        // accumulated so far as one observation.
        let crossing = feedback_received(start + 2 * OBSERVATION_DURATION_LOWER_BOUND);
        assert!(window.append(&crossing));
        assert_eq!(window.len(), 2);
        let newest = window.newest().unwrap();
        assert_eq!(newest.num_packets, 4);
    }

    #[test]
    fn test_sending_rate_from_span() {
        let mut window = window();
        let start = Instant::now();
        // 30000 bytes sent over a 250ms send span.
        window.append(&feedback_received(start));
        assert_eq!(
            window.newest().unwrap().sending_rate,
            Bitrate::from_kbps(960)
        );
    }

    #[test]
    fn test_sending_rate_smoothing() {
        let mut config = Config::default();
        config.sending_rate_smoothing_factor = 0.5;
        let mut window = ObservationWindow::new(&config);
        let start = Instant::now();
        window.append(&feedback_received(start));
        // Second observation spans 500ms at half the rate; the EMA lands in
        // the middle.
        window.append(&feedback_received(
            start + 2 * OBSERVATION_DURATION_LOWER_BOUND,
        ));
        assert_eq!(
            window.newest().unwrap().sending_rate,
            Bitrate::from_kbps(720)
        );
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut config = Config::default();
        config.observation_window_size = 2;
        let mut window = ObservationWindow::new(&config);
        let start = Instant::now();
        for i in 0..3u32 {
            window.append(&feedback_received(
                start + 2 * i * OBSERVATION_DURATION_LOWER_BOUND,
            ));
        }
        assert_eq!(window.len(), 3);
        let ids: Vec<u64> = window.weighted().map(|(observation, _)| observation.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
    }

    #[test]
    fn test_average_loss_ratio_is_temporally_weighted() {
        let mut config = Config::default();
        config.observation_window_size = 2;
        config.instant_upper_bound_temporal_weight_factor = 0.9;
        let mut window = ObservationWindow::new(&config);
        let start = Instant::now();

        let mut all_lost = feedback_received(start);
        for packet in &mut all_lost {
            packet.receive_time = None;
        }
        window.append(&all_lost);
        assert_abs_diff_eq!(window.average_reported_loss_ratio(), 1.0);

        window.append(&feedback_received(
            start + 2 * OBSERVATION_DURATION_LOWER_BOUND,
        ));
        // Newest (no loss) weighs 1.0, older (all lost) weighs 0.9.
        assert_abs_diff_eq!(
            window.average_reported_loss_ratio(),
            1.8 / 3.8,
            epsilon = 1e-9
        );
    }
}

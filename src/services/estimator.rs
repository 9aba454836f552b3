//! RSSI smoothing and distance estimation
//!
//! Raw RSSI readings are noisy. Each tracked beacon gets its own filter state;
//! the smoothed value is converted to a unitless distance figure with the
//! usual two-regime path-loss approximation.
//!
//! Filters are interchangeable behind [`RssiFilter`] and selected by
//! `[filter] kind` in the config.

use crate::domain::types::BeaconIdentity;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::VecDeque;

/// Process noise
const KALMAN_Q: f64 = 1e-6;
/// Measurement noise
const KALMAN_R: f64 = 1e-3;
/// Variance of a freshly seeded estimate
const KALMAN_P0: f64 = 1.0;
/// Samples kept per beacon by the replay filter
const REPLAY_DEPTH: usize = 30;

/// Filter strategy selected in config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Incremental scalar Kalman filter
    #[default]
    Kalman,
    /// Kalman pass replayed over the last samples on every call
    KalmanReplay,
    /// Floor mean over a fixed wall-clock window
    WindowAverage,
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::Kalman => "kalman",
            FilterKind::KalmanReplay => "kalman_replay",
            FilterKind::WindowAverage => "window_average",
        }
    }
}

/// Per-beacon RSSI smoothing
pub trait RssiFilter: Send {
    /// Feed one reading. `None` means the reading was absorbed without output.
    fn filter(&mut self, identity: &BeaconIdentity, rssi: i32, at: DateTime<Utc>) -> Option<i32>;

    /// Forget all state for a beacon
    fn clear(&mut self, identity: &BeaconIdentity);

    /// Number of beacons with live state
    fn tracked(&self) -> usize;

    /// Drop the state of every beacon last heard before `cutoff`.
    /// Returns how many beacons were dropped.
    fn evict_idle(&mut self, cutoff: DateTime<Utc>) -> usize;
}

/// Filter state plus the time of the latest reading that touched it
struct Tracked<T> {
    state: T,
    last_seen: DateTime<Utc>,
}

fn retain_recent<T>(
    map: &mut FxHashMap<BeaconIdentity, Tracked<T>>,
    cutoff: DateTime<Utc>,
) -> usize {
    let before = map.len();
    map.retain(|_, tracked| tracked.last_seen >= cutoff);
    before - map.len()
}

/// Build the filter configured by `kind`
pub fn build_filter(kind: FilterKind, prior_rssi: f64, window_ms: u64) -> Box<dyn RssiFilter> {
    match kind {
        FilterKind::Kalman => Box::new(KalmanFilter::new(prior_rssi)),
        FilterKind::KalmanReplay => Box::new(ReplayKalmanFilter::new(prior_rssi)),
        FilterKind::WindowAverage => Box::new(WindowAverage::new(window_ms)),
    }
}

#[derive(Debug, Clone, Copy)]
struct KalmanState {
    estimate: f64,
    variance: f64,
}

impl KalmanState {
    fn seeded(prior: f64) -> Self {
        Self { estimate: prior, variance: KALMAN_P0 }
    }

    #[inline]
    fn update(&mut self, measurement: f64) {
        let predicted_variance = self.variance + KALMAN_Q;
        let gain = predicted_variance / (predicted_variance + KALMAN_R);
        self.estimate += gain * (measurement - self.estimate);
        self.variance = (1.0 - gain) * predicted_variance;
    }
}

/// Incremental scalar Kalman filter, O(1) per reading
pub struct KalmanFilter {
    prior: f64,
    states: FxHashMap<BeaconIdentity, Tracked<KalmanState>>,
}

impl KalmanFilter {
    pub fn new(prior: f64) -> Self {
        Self { prior, states: FxHashMap::default() }
    }
}

impl RssiFilter for KalmanFilter {
    fn filter(&mut self, identity: &BeaconIdentity, rssi: i32, at: DateTime<Utc>) -> Option<i32> {
        let prior = self.prior;
        let tracked = self
            .states
            .entry(identity.clone())
            .or_insert_with(|| Tracked { state: KalmanState::seeded(prior), last_seen: at });
        tracked.last_seen = at;
        tracked.state.update(f64::from(rssi));
        Some(tracked.state.estimate.trunc() as i32)
    }

    fn clear(&mut self, identity: &BeaconIdentity) {
        self.states.remove(identity);
    }

    fn tracked(&self) -> usize {
        self.states.len()
    }

    fn evict_idle(&mut self, cutoff: DateTime<Utc>) -> usize {
        retain_recent(&mut self.states, cutoff)
    }
}

/// Replays a full Kalman pass over the last [`REPLAY_DEPTH`] readings.
///
/// The first buffered reading only seeds the buffer and is not folded into
/// the estimate, so a single reading yields the prior.
pub struct ReplayKalmanFilter {
    prior: f64,
    buffers: FxHashMap<BeaconIdentity, Tracked<VecDeque<i32>>>,
}

impl ReplayKalmanFilter {
    pub fn new(prior: f64) -> Self {
        Self { prior, buffers: FxHashMap::default() }
    }

    fn replay(&self, readings: &VecDeque<i32>) -> f64 {
        let mut state = KalmanState::seeded(self.prior);
        for &z in readings.iter().skip(1) {
            state.update(f64::from(z));
        }
        state.estimate
    }
}

impl RssiFilter for ReplayKalmanFilter {
    fn filter(&mut self, identity: &BeaconIdentity, rssi: i32, at: DateTime<Utc>) -> Option<i32> {
        let tracked = self
            .buffers
            .entry(identity.clone())
            .or_insert_with(|| Tracked { state: VecDeque::with_capacity(REPLAY_DEPTH), last_seen: at });
        tracked.last_seen = at;
        if tracked.state.len() == REPLAY_DEPTH {
            tracked.state.pop_front();
        }
        tracked.state.push_back(rssi);

        let tracked = self.buffers.get(identity)?;
        Some(self.replay(&tracked.state).trunc() as i32)
    }

    fn clear(&mut self, identity: &BeaconIdentity) {
        self.buffers.remove(identity);
    }

    fn tracked(&self) -> usize {
        self.buffers.len()
    }

    fn evict_idle(&mut self, cutoff: DateTime<Utc>) -> usize {
        retain_recent(&mut self.buffers, cutoff)
    }
}

struct Window {
    started_at: DateTime<Utc>,
    readings: Vec<i32>,
}

/// Emits the floor mean of each elapsed window.
///
/// A window closes on the first reading strictly more than `length` after it
/// opened; a reading exactly at `length` is still absorbed.
pub struct WindowAverage {
    length: Duration,
    windows: FxHashMap<BeaconIdentity, Tracked<Window>>,
}

impl WindowAverage {
    pub fn new(window_ms: u64) -> Self {
        let length = Duration::milliseconds(i64::try_from(window_ms).unwrap_or(i64::MAX));
        Self { length, windows: FxHashMap::default() }
    }
}

impl RssiFilter for WindowAverage {
    fn filter(&mut self, identity: &BeaconIdentity, rssi: i32, at: DateTime<Utc>) -> Option<i32> {
        let Some(tracked) = self.windows.get_mut(identity) else {
            let window = Window { started_at: at, readings: vec![rssi] };
            self.windows.insert(identity.clone(), Tracked { state: window, last_seen: at });
            return None;
        };
        tracked.last_seen = at;
        let window = &mut tracked.state;

        if at - window.started_at <= self.length {
            window.readings.push(rssi);
            return None;
        }

        let sum: i64 = window.readings.iter().map(|&r| i64::from(r)).sum();
        let count = window.readings.len().max(1) as i64;
        let mean = sum.div_euclid(count);

        // current reading opens the next window
        window.started_at = at;
        window.readings.clear();
        window.readings.push(rssi);

        i32::try_from(mean).ok()
    }

    fn clear(&mut self, identity: &BeaconIdentity) {
        self.windows.remove(identity);
    }

    fn tracked(&self) -> usize {
        self.windows.len()
    }

    fn evict_idle(&mut self, cutoff: DateTime<Utc>) -> usize {
        retain_recent(&mut self.windows, cutoff)
    }
}

/// Convert a smoothed RSSI to a distance figure.
///
/// `tx_power` is the calibrated RSSI at one metre; zero is treated as 1.
/// Halves round to even. Results saturate into `u32`.
pub fn distance(tx_power: i32, rssi: i32) -> u32 {
    let tx_power = if tx_power == 0 { 1 } else { tx_power };
    let ratio = f64::from(rssi) / f64::from(tx_power);

    let raw = if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976 * ratio.powf(7.7095) + 0.111
    };

    // float-to-int `as` saturates and maps NaN to 0
    raw.round_ties_even() as u32
}

//! In-process delivery telemetry.
//!
//! The channel set is closed, so each channel owns its own lock and recording on
//! one channel never contends with another. The global attempt history and the
//! named counters/gauges each sit behind a separate lock. Every read hands back
//! an owned copy.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use courier_common::types::{Channel, ChannelMetrics, DeliveryAttempt, DeliveryStatus, MessageMetrics};

/// Latency samples and error records kept per channel.
const CHANNEL_HISTORY: usize = 1_000;

/// Attempts kept in the global history.
const ATTEMPT_HISTORY: usize = 10_000;

/// Lifetime counters for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub total_attempts: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub total_latency_ms: u64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub error: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub attempt: DeliveryAttempt,
}

/// Percentiles over the retained latency samples, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    at: DateTime<Utc>,
    ms: u64,
}

#[derive(Default)]
struct ChannelState {
    stats: ChannelStats,
    latencies: VecDeque<LatencySample>,
    errors: VecDeque<ErrorRecord>,
}

#[derive(Default)]
struct Instruments {
    counters: HashMap<String, i64>,
    gauges: HashMap<String, f64>,
}

/// Concurrency-safe telemetry collector shared by the dispatch engine and the API.
pub struct Telemetry {
    channels: [Mutex<ChannelState>; 4],
    attempts: Mutex<VecDeque<AttemptRecord>>,
    instruments: Mutex<Instruments>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            channels: Default::default(),
            attempts: Mutex::new(VecDeque::with_capacity(ATTEMPT_HISTORY)),
            instruments: Mutex::new(Instruments::default()),
        }
    }

    fn channel(&self, channel: Channel) -> &Mutex<ChannelState> {
        &self.channels[channel.index()]
    }

    /// Record the outcome of one delivery attempt.
    pub fn record_attempt(&self, attempt: &DeliveryAttempt) {
        let now = Utc::now();
        {
            let mut state = self.channel(attempt.channel).lock();
            let stats = &mut state.stats;
            stats.total_attempts += 1;
            stats.last_activity = Some(now);
            match attempt.status {
                DeliveryStatus::Sent => stats.sent += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Pending => {}
            }
        }

        let mut attempts = self.attempts.lock();
        if attempts.len() == ATTEMPT_HISTORY {
            attempts.pop_front();
        }
        attempts.push_back(AttemptRecord {
            timestamp: now,
            attempt: attempt.clone(),
        });
    }

    /// Record how long one provider call took.
    pub fn record_latency(&self, channel: Channel, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let mut state = self.channel(channel).lock();
        let stats = &mut state.stats;
        stats.total_latency_ms += ms;
        stats.min_latency_ms = Some(stats.min_latency_ms.map_or(ms, |m| m.min(ms)));
        stats.max_latency_ms = Some(stats.max_latency_ms.map_or(ms, |m| m.max(ms)));

        if state.latencies.len() == CHANNEL_HISTORY {
            state.latencies.pop_front();
        }
        state.latencies.push_back(LatencySample { at: Utc::now(), ms });
    }

    pub fn record_error(&self, channel: Channel, kind: &str, error: &str) {
        let mut state = self.channel(channel).lock();
        if state.errors.len() == CHANNEL_HISTORY {
            state.errors.pop_front();
        }
        state.errors.push_back(ErrorRecord {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            error: error.to_string(),
            channel,
        });
    }

    /// Increment a named counter. Tags become part of the counter key.
    pub fn increment_counter(&self, name: &str, tags: &[(&str, &str)]) {
        let key = instrument_key(name, tags);
        *self.instruments.lock().counters.entry(key).or_insert(0) += 1;
    }

    pub fn record_gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let key = instrument_key(name, tags);
        self.instruments.lock().gauges.insert(key, value);
    }

    pub fn get_counters(&self) -> HashMap<String, i64> {
        self.instruments.lock().counters.clone()
    }

    pub fn get_gauges(&self) -> HashMap<String, f64> {
        self.instruments.lock().gauges.clone()
    }

    /// Aggregate the attempts and latency samples recorded within `[start, end]`.
    pub fn get_metrics(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> MessageMetrics {
        let in_window = |t: DateTime<Utc>| t >= start && t <= end;

        let mut by_channel: HashMap<Channel, ChannelMetrics> = HashMap::new();
        {
            let attempts = self.attempts.lock();
            for record in attempts.iter().filter(|r| in_window(r.timestamp)) {
                let metrics = by_channel.entry(record.attempt.channel).or_default();
                match record.attempt.status {
                    DeliveryStatus::Sent => metrics.sent += 1,
                    DeliveryStatus::Delivered => metrics.delivered += 1,
                    DeliveryStatus::Failed => metrics.failed += 1,
                    DeliveryStatus::Pending => {}
                }
            }
        }

        let mut result = MessageMetrics::default();
        let mut total_latency = 0u64;

        for (channel, metrics) in by_channel.iter_mut() {
            let channel_latency: u64 = self
                .channel(*channel)
                .lock()
                .latencies
                .iter()
                .filter(|s| in_window(s.at))
                .map(|s| s.ms)
                .sum();

            let attempted = metrics.sent + metrics.delivered + metrics.failed;
            metrics.delivery_rate = ratio(metrics.delivered, attempted);
            metrics.avg_latency = if attempted > 0 { channel_latency / attempted } else { 0 };

            result.total_sent += metrics.sent;
            result.total_delivered += metrics.delivered;
            result.total_failed += metrics.failed;
            total_latency += channel_latency;
        }

        let attempted = result.total_sent + result.total_delivered + result.total_failed;
        result.delivery_rate = ratio(result.total_delivered, attempted);
        result.average_latency = if attempted > 0 { total_latency / attempted } else { 0 };
        result.by_channel = by_channel;
        result
    }

    /// Lifetime counters for `channel`, or `None` if nothing was recorded on it.
    pub fn get_channel_stats(&self, channel: Channel) -> Option<ChannelStats> {
        let state = self.channel(channel).lock();
        let untouched = state.stats.total_attempts == 0 && state.stats.min_latency_ms.is_none();
        (!untouched).then(|| state.stats.clone())
    }

    /// Most recent errors for `channel`, oldest first. A `limit` of 0 means all.
    pub fn get_recent_errors(&self, channel: Channel, limit: usize) -> Vec<ErrorRecord> {
        let state = self.channel(channel).lock();
        tail(&state.errors, limit)
    }

    /// Most recent attempts across all channels, oldest first. A `limit` of 0 means all.
    pub fn get_recent_attempts(&self, limit: usize) -> Vec<AttemptRecord> {
        tail(&self.attempts.lock(), limit)
    }

    pub fn get_latency_stats(&self, channel: Channel) -> Option<LatencyStats> {
        let mut sorted: Vec<u64> = self
            .channel(channel)
            .lock()
            .latencies
            .iter()
            .map(|s| s.ms)
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        let at = |p: usize| sorted[sorted.len() * p / 100];
        Some(LatencyStats {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: at(50),
            p90: at(90),
            p95: at(95),
            p99: at(99),
        })
    }

    /// Drop everything recorded so far.
    pub fn reset(&self) {
        for channel in &self.channels {
            *channel.lock() = ChannelState::default();
        }
        self.attempts.lock().clear();
        *self.instruments.lock() = Instruments::default();
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

fn tail<T: Clone>(items: &VecDeque<T>, limit: usize) -> Vec<T> {
    let take = if limit == 0 { items.len() } else { limit.min(items.len()) };
    items.iter().skip(items.len() - take).cloned().collect()
}

fn instrument_key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    tags.sort();
    format!("{name}{{{}}}", tags.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn make_attempt(channel: Channel, status: DeliveryStatus) -> DeliveryAttempt {
        DeliveryAttempt {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            channel,
            status,
            attempted_at: Utc::now(),
            error: None,
            retry_count: 0,
            next_retry_at: None,
            provider_message_id: None,
            latency_ms: None,
        }
    }

    fn around_now() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1))
    }

    #[test]
    fn test_metrics_formulas() {
        let telemetry = Telemetry::new();
        telemetry.record_attempt(&make_attempt(Channel::Email, DeliveryStatus::Delivered));
        telemetry.record_attempt(&make_attempt(Channel::Email, DeliveryStatus::Sent));
        telemetry.record_attempt(&make_attempt(Channel::Email, DeliveryStatus::Failed));
        telemetry.record_attempt(&make_attempt(Channel::Sms, DeliveryStatus::Delivered));
        telemetry.record_latency(Channel::Email, Duration::from_millis(300));
        telemetry.record_latency(Channel::Sms, Duration::from_millis(100));

        let (start, end) = around_now();
        let metrics = telemetry.get_metrics(start, end);

        assert_eq!(metrics.total_sent, 1);
        assert_eq!(metrics.total_delivered, 2);
        assert_eq!(metrics.total_failed, 1);
        assert!((metrics.delivery_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.average_latency, 100);

        let email = &metrics.by_channel[&Channel::Email];
        assert!((email.delivery_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(email.avg_latency, 100);
    }

    #[test]
    fn test_metrics_outside_window_are_empty() {
        let telemetry = Telemetry::new();
        telemetry.record_attempt(&make_attempt(Channel::Push, DeliveryStatus::Sent));

        let past = Utc::now() - chrono::Duration::hours(2);
        let metrics = telemetry.get_metrics(past, past + chrono::Duration::hours(1));
        assert_eq!(metrics.total_sent, 0);
        assert_eq!(metrics.delivery_rate, 0.0);
        assert!(metrics.by_channel.is_empty());
    }

    #[test]
    fn test_channel_stats_min_max() {
        let telemetry = Telemetry::new();
        assert!(telemetry.get_channel_stats(Channel::Webhook).is_none());

        telemetry.record_latency(Channel::Webhook, Duration::from_millis(40));
        telemetry.record_latency(Channel::Webhook, Duration::from_millis(10));
        telemetry.record_latency(Channel::Webhook, Duration::from_millis(90));

        let stats = telemetry.get_channel_stats(Channel::Webhook).unwrap();
        assert_eq!(stats.min_latency_ms, Some(10));
        assert_eq!(stats.max_latency_ms, Some(90));
        assert_eq!(stats.total_latency_ms, 140);
    }

    #[test]
    fn test_latency_percentiles() {
        let telemetry = Telemetry::new();
        for ms in (1..=100).rev() {
            telemetry.record_latency(Channel::Email, Duration::from_millis(ms));
        }

        let stats = telemetry.get_latency_stats(Channel::Email).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 100);
        assert_eq!(stats.p50, 51);
        assert_eq!(stats.p90, 91);
        assert_eq!(stats.p95, 96);
        assert_eq!(stats.p99, 100);
        assert!(telemetry.get_latency_stats(Channel::Sms).is_none());
    }

    #[test]
    fn test_rings_evict_oldest() {
        let telemetry = Telemetry::new();
        for i in 0..(CHANNEL_HISTORY + 5) {
            telemetry.record_error(Channel::Sms, "network_error", &format!("error {i}"));
        }

        let errors = telemetry.get_recent_errors(Channel::Sms, 0);
        assert_eq!(errors.len(), CHANNEL_HISTORY);
        assert_eq!(errors[0].error, "error 5");

        let recent = telemetry.get_recent_errors(Channel::Sms, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].error, format!("error {}", CHANNEL_HISTORY + 4));
    }

    #[test]
    fn test_latency_ring_keeps_last_thousand() {
        let telemetry = Telemetry::new();
        for ms in 1..=(CHANNEL_HISTORY as u64 + 500) {
            telemetry.record_latency(Channel::Push, Duration::from_millis(ms));
        }
        assert_eq!(CHANNEL_HISTORY, 1_000);

        let stats = telemetry.get_latency_stats(Channel::Push).unwrap();
        assert_eq!(stats.count, 1_000);
        // The first 500 samples were evicted
        assert_eq!(stats.min, 501);
        assert_eq!(stats.max, 1_500);

        // Lifetime counters are not bounded by the ring
        let lifetime = telemetry.get_channel_stats(Channel::Push).unwrap();
        assert_eq!(lifetime.min_latency_ms, Some(1));
    }

    #[test]
    fn test_attempt_ring_keeps_last_ten_thousand() {
        let telemetry = Telemetry::new();
        let overflow = 25;
        for _ in 0..(ATTEMPT_HISTORY + overflow) {
            telemetry.record_attempt(&make_attempt(Channel::Email, DeliveryStatus::Sent));
        }
        assert_eq!(ATTEMPT_HISTORY, 10_000);
        assert_eq!(telemetry.get_recent_attempts(0).len(), 10_000);

        let stats = telemetry.get_channel_stats(Channel::Email).unwrap();
        assert_eq!(stats.total_attempts, (ATTEMPT_HISTORY + overflow) as u64);
    }

    #[test]
    fn test_recent_attempts_limit() {
        let telemetry = Telemetry::new();
        for _ in 0..5 {
            telemetry.record_attempt(&make_attempt(Channel::Email, DeliveryStatus::Sent));
        }
        assert_eq!(telemetry.get_recent_attempts(3).len(), 3);
        assert_eq!(telemetry.get_recent_attempts(50).len(), 5);
    }

    #[test]
    fn test_counters_gauges_and_reset() {
        let telemetry = Telemetry::new();
        telemetry.increment_counter("messages_sent", &[]);
        telemetry.increment_counter("messages_sent", &[]);
        telemetry.increment_counter("attempts", &[("status", "failed"), ("channel", "sms")]);
        telemetry.record_gauge("queue_depth", 4.0, &[]);

        let counters = telemetry.get_counters();
        assert_eq!(counters["messages_sent"], 2);
        assert_eq!(counters["attempts{channel=sms,status=failed}"], 1);
        assert_eq!(telemetry.get_gauges()["queue_depth"], 4.0);

        telemetry.record_attempt(&make_attempt(Channel::Email, DeliveryStatus::Sent));
        telemetry.reset();
        assert!(telemetry.get_counters().is_empty());
        assert!(telemetry.get_recent_attempts(0).is_empty());
        assert!(telemetry.get_channel_stats(Channel::Email).is_none());
    }

    #[test]
    fn test_concurrent_recording_is_lossless() {
        let telemetry = Arc::new(Telemetry::new());
        let handles: Vec<_> = Channel::ALL
            .into_iter()
            .flat_map(|channel| {
                (0..4).map(move |_| channel)
            })
            .map(|channel| {
                let telemetry = Arc::clone(&telemetry);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        telemetry.record_attempt(&make_attempt(channel, DeliveryStatus::Sent));
                        telemetry.record_latency(channel, Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for channel in Channel::ALL {
            assert_eq!(telemetry.get_channel_stats(channel).unwrap().total_attempts, 1_000);
        }
        assert_eq!(telemetry.get_recent_attempts(0).len(), 4_000);
    }
}

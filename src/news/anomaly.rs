// =============================================================================
// Anomaly Detector — z-score heat anomalies, syndication, pattern diagnostics
// =============================================================================
//
// Point anomalies over a rolling window of heat samples (newest first):
//
//   z = (current - baseline_mean) / baseline_std     (baseline = prior samples)
//   z >=  3  -> SUDDEN_SPIKE
//   z <= -3  -> SUDDEN_DROP
//   |z_velocity| >= 2 -> VELOCITY_ANOMALY (when a velocity channel exists)
//
// Baselines with stdDev < 0.1 are skipped outright — a flat series produces
// no false positives. Severity maps from |z|: <2 LOW, <3 MEDIUM, <4 HIGH,
// else CRITICAL.
//
// CROSS_SYNDICATION groups clusters by lowercased topic key across
// categories; pattern diagnostics run over longer histories.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::{HeatSample, StoryCluster};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyType {
    SuddenSpike,
    SuddenDrop,
    VelocityAnomaly,
    CrossSyndication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One detected anomaly, published on the NEWS_ANOMALY channel.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub cluster_id: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub z_score: f64,
    pub current: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub detail: String,
    /// Related cluster ids (used by cross-syndication events).
    pub related: Vec<String>,
    pub at: String,
}

/// Longer-horizon shape of a heat series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeatPattern {
    OscillatingHeat,
    StepPattern,
    LinearDecay,
    LinearGrowth,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct AnomalyDetector {
    /// Samples considered per detection pass.
    window: usize,
    /// Minimum baseline samples before detection runs.
    min_samples: usize,
    /// Baselines flatter than this are skipped.
    min_std_dev: f64,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            window: 10,
            min_samples: 5,
            min_std_dev: 0.1,
        }
    }

    // -------------------------------------------------------------------------
    // Point anomalies
    // -------------------------------------------------------------------------

    /// Detect spike/drop/velocity anomalies. `samples` is newest first (as
    /// returned by the store); the newest sample is the observation and the
    /// rest of the window is the baseline.
    pub fn detect(&self, cluster_id: &str, samples: &[HeatSample]) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();
        let window = &samples[..samples.len().min(self.window)];
        if window.len() < self.min_samples {
            return events;
        }

        let current = &window[0];
        let baseline = &window[1..];

        if let Some((mean, std_dev)) = mean_std(baseline.iter().map(|s| s.heat_score)) {
            if std_dev >= self.min_std_dev {
                let z = (current.heat_score - mean) / std_dev;
                if z >= 3.0 {
                    events.push(self.event(
                        cluster_id,
                        AnomalyType::SuddenSpike,
                        z,
                        current.heat_score,
                        mean,
                        std_dev,
                        format!("heat spiked to {:.2} (baseline {mean:.2})", current.heat_score),
                    ));
                } else if z <= -3.0 {
                    events.push(self.event(
                        cluster_id,
                        AnomalyType::SuddenDrop,
                        z,
                        current.heat_score,
                        mean,
                        std_dev,
                        format!("heat dropped to {:.2} (baseline {mean:.2})", current.heat_score),
                    ));
                }
            } else {
                debug!(cluster_id, std_dev, "baseline too flat — detection skipped");
            }
        }

        // Velocity channel, when present on both the observation and enough
        // of the baseline.
        if let Some(current_vel) = current.velocity {
            let baseline_vels: Vec<f64> = baseline.iter().filter_map(|s| s.velocity).collect();
            if baseline_vels.len() + 1 >= self.min_samples {
                if let Some((mean, std_dev)) = mean_std(baseline_vels.iter().copied()) {
                    if std_dev >= self.min_std_dev {
                        let z = (current_vel - mean) / std_dev;
                        if z.abs() >= 2.0 {
                            events.push(self.event(
                                cluster_id,
                                AnomalyType::VelocityAnomaly,
                                z,
                                current_vel,
                                mean,
                                std_dev,
                                format!("heat velocity {current_vel:.2} vs baseline {mean:.2}"),
                            ));
                        }
                    }
                }
            }
        }

        events
    }

    /// |z| to severity.
    pub fn severity(z: f64) -> Severity {
        let abs = z.abs();
        if abs < 2.0 {
            Severity::Low
        } else if abs < 3.0 {
            Severity::Medium
        } else if abs < 4.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    // -------------------------------------------------------------------------
    // Cross-syndication
    // -------------------------------------------------------------------------

    /// Emit one event per topic key that appears in two or more categories.
    /// The hottest cluster of the group is the source; the rest are targets.
    pub fn cross_syndication(&self, clusters: &[StoryCluster]) -> Vec<AnomalyEvent> {
        let mut groups: HashMap<String, Vec<&StoryCluster>> = HashMap::new();
        for cluster in clusters {
            groups
                .entry(cluster.topic_key.to_lowercase())
                .or_default()
                .push(cluster);
        }

        let mut events = Vec::new();
        for (topic_key, group) in groups {
            let categories: std::collections::HashSet<&str> =
                group.iter().map(|c| c.category.as_str()).collect();
            if categories.len() < 2 {
                continue;
            }

            let source = group
                .iter()
                .max_by(|a, b| {
                    a.heat_score
                        .partial_cmp(&b.heat_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("group is non-empty");
            let targets: Vec<String> = group
                .iter()
                .filter(|c| c.id != source.id)
                .map(|c| c.id.clone())
                .collect();

            events.push(AnomalyEvent {
                cluster_id: source.id.clone(),
                anomaly_type: AnomalyType::CrossSyndication,
                severity: Severity::Medium,
                z_score: 0.0,
                current: source.heat_score,
                mean: 0.0,
                std_dev: 0.0,
                detail: format!(
                    "topic '{topic_key}' syndicated across {} categories",
                    categories.len()
                ),
                related: targets,
                at: Utc::now().to_rfc3339(),
            });
        }
        events
    }

    // -------------------------------------------------------------------------
    // Pattern diagnostics
    // -------------------------------------------------------------------------

    /// Classify the longer-horizon shape of a heat series (newest first).
    /// Returns `None` below 10 samples.
    pub fn detect_pattern(&self, samples: &[HeatSample]) -> Option<HeatPattern> {
        if samples.len() < 10 {
            return None;
        }
        // Work oldest-first.
        let series: Vec<f64> = samples.iter().rev().map(|s| s.heat_score).collect();
        let n = series.len();

        // Direction changes.
        let mut changes = 0usize;
        let mut last_dir = 0i8;
        let mut up_steps = 0usize;
        let mut down_steps = 0usize;
        for pair in series.windows(2) {
            let delta = pair[1] - pair[0];
            let dir = if delta > 0.0 {
                up_steps += 1;
                1
            } else if delta < 0.0 {
                down_steps += 1;
                -1
            } else {
                0
            };
            if dir != 0 && last_dir != 0 && dir != last_dir {
                changes += 1;
            }
            if dir != 0 {
                last_dir = dir;
            }
        }

        if changes as f64 > 0.6 * n as f64 {
            return Some(HeatPattern::OscillatingHeat);
        }

        // Step: one jump above 30 % of the series max, low variance after.
        let max = series.iter().cloned().fold(f64::MIN, f64::max);
        if max > 0.0 {
            for i in 1..n {
                let jump = series[i] - series[i - 1];
                if jump > 0.3 * max && i + 1 < n {
                    if let Some((mean, std_dev)) = mean_std(series[i..].iter().copied()) {
                        if mean > 0.0 && std_dev / mean < 0.1 {
                            return Some(HeatPattern::StepPattern);
                        }
                    }
                }
            }
        }

        if down_steps > 2 * up_steps {
            return Some(HeatPattern::LinearDecay);
        }
        if up_steps > 2 * down_steps {
            return Some(HeatPattern::LinearGrowth);
        }
        None
    }

    fn event(
        &self,
        cluster_id: &str,
        anomaly_type: AnomalyType,
        z: f64,
        current: f64,
        mean: f64,
        std_dev: f64,
        detail: String,
    ) -> AnomalyEvent {
        AnomalyEvent {
            cluster_id: cluster_id.to_string(),
            anomaly_type,
            severity: Self::severity(z),
            z_score: z,
            current,
            mean,
            std_dev,
            detail,
            related: Vec::new(),
            at: Utc::now().to_rfc3339(),
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean and population standard deviation; `None` on an empty iterator.
fn mean_std(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::news::model::{TrendDirection, Urgency};

    /// Build newest-first samples from an oldest-first heat series.
    fn samples(heats: &[f64]) -> Vec<HeatSample> {
        heats
            .iter()
            .rev()
            .map(|&h| HeatSample {
                cluster_id: "c-1".into(),
                timestamp: Utc::now(),
                heat_score: h,
                article_count: 1,
                unique_title_count: 1,
                velocity: None,
            })
            .collect()
    }

    #[test]
    fn empty_history_yields_nothing() {
        let detector = AnomalyDetector::new();
        assert!(detector.detect("c-1", &[]).is_empty());
    }

    #[test]
    fn flat_baseline_is_skipped() {
        let detector = AnomalyDetector::new();
        // Baseline identical values: stdDev = 0 < 0.1 — no false positives
        // even with a wild current value.
        let s = samples(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 500.0]);
        assert!(detector.detect("c-1", &s).is_empty());
    }

    #[test]
    fn spike_detected_with_critical_severity() {
        let detector = AnomalyDetector::new();
        let s = samples(&[10.0, 11.0, 9.0, 10.0, 11.0, 9.0, 10.0, 11.0, 9.0, 60.0]);
        let events = detector.detect("c-1", &s);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].anomaly_type, AnomalyType::SuddenSpike);
        assert!(events[0].z_score >= 3.0);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn drop_detected() {
        let detector = AnomalyDetector::new();
        let s = samples(&[50.0, 51.0, 49.0, 50.0, 51.0, 49.0, 50.0, 51.0, 49.0, 2.0]);
        let events = detector.detect("c-1", &s);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].anomaly_type, AnomalyType::SuddenDrop);
        assert!(events[0].z_score <= -3.0);
    }

    #[test]
    fn velocity_channel_detected() {
        let detector = AnomalyDetector::new();
        let mut s = samples(&[10.0, 10.5, 9.5, 10.0, 10.5, 9.5, 10.2]);
        for (i, sample) in s.iter_mut().enumerate() {
            sample.velocity = Some(if i == 0 { 8.0 } else { 1.0 + 0.2 * (i % 3) as f64 });
        }
        let events = detector.detect("c-1", &s);
        assert!(events
            .iter()
            .any(|e| e.anomaly_type == AnomalyType::VelocityAnomaly));
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(AnomalyDetector::severity(1.5), Severity::Low);
        assert_eq!(AnomalyDetector::severity(-2.5), Severity::Medium);
        assert_eq!(AnomalyDetector::severity(3.5), Severity::High);
        assert_eq!(AnomalyDetector::severity(4.1), Severity::Critical);
    }

    fn cluster(id: &str, topic_key: &str, category: &str, heat: f64) -> StoryCluster {
        let now = Utc::now();
        StoryCluster {
            id: id.into(),
            topic: topic_key.replace('_', " "),
            topic_key: topic_key.into(),
            summary: String::new(),
            category: category.into(),
            keywords: vec![],
            heat_score: heat,
            article_count: 1,
            unique_title_count: 1,
            trend_direction: TrendDirection::Neutral,
            urgency: Urgency::Medium,
            sub_event_type: None,
            first_seen: now,
            updated_at: now,
        }
    }

    #[test]
    fn cross_syndication_requires_two_categories() {
        let detector = AnomalyDetector::new();
        let clusters = vec![
            cluster("c-1", "fed_raises_rates", "MACRO", 80.0),
            cluster("c-2", "fed_raises_rates", "CRYPTO", 50.0),
            cluster("c-3", "nvidia_earnings", "STOCKS", 40.0),
        ];
        let events = detector.cross_syndication(&clusters);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].anomaly_type, AnomalyType::CrossSyndication);
        // Hottest is the source; the other is a target.
        assert_eq!(events[0].cluster_id, "c-1");
        assert_eq!(events[0].related, vec!["c-2".to_string()]);
    }

    #[test]
    fn oscillating_pattern() {
        let detector = AnomalyDetector::new();
        let s = samples(&[10.0, 20.0, 10.0, 20.0, 10.0, 20.0, 10.0, 20.0, 10.0, 20.0, 10.0, 20.0]);
        assert_eq!(detector.detect_pattern(&s), Some(HeatPattern::OscillatingHeat));
    }

    #[test]
    fn step_pattern() {
        let detector = AnomalyDetector::new();
        let s = samples(&[10.0, 10.0, 10.0, 10.0, 10.0, 50.0, 50.0, 50.0, 50.0, 50.0, 50.0]);
        assert_eq!(detector.detect_pattern(&s), Some(HeatPattern::StepPattern));
    }

    #[test]
    fn growth_and_decay_patterns() {
        let detector = AnomalyDetector::new();
        let growing = samples(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(detector.detect_pattern(&growing), Some(HeatPattern::LinearGrowth));

        let decaying = samples(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
        assert_eq!(detector.detect_pattern(&decaying), Some(HeatPattern::LinearDecay));
    }

    #[test]
    fn short_history_no_pattern() {
        let detector = AnomalyDetector::new();
        assert!(detector.detect_pattern(&samples(&[1.0, 2.0, 3.0])).is_none());
    }
}

// =============================================================================
// Heat Predictor — lifecycle-aware heat forecasting over 1/6/24 h horizons
// =============================================================================
//
// Factors from a window of heat samples (most recent first, >= 24 samples):
//
//   trend      — regression slope normalized by the mean, clipped to [-1, 1]
//   volatility — stdDev / mean
//   momentum   — (mean of newest 5 - mean of next 5) / mean of next 5
//   lifecycle  — EMERGING / GROWING / PEAK / DECAYING / STABLE from the
//                series position-in-range crossed with the recent trend
//
// Forecast per horizon h:
//   start   = current + trend * stdDev * h * 0.5
//   staged  = start * stage_factor^h * (1 + momentum * 0.1 * h), clamped >= 0
//   conf    = exp(-h/12) * exp(-2 * volatility)
//   95 % CI = staged +/- 1.96 * stdDev * sqrt(h) * (1 + volatility), lower >= 0
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::HeatSample;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStage {
    Emerging,
    Growing,
    Peak,
    Decaying,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trajectory {
    Spiking,
    Crashing,
    Growing,
    Decaying,
    Stable,
}

/// One horizon's forecast.
#[derive(Debug, Clone, Serialize)]
pub struct HeatForecast {
    pub horizon_hours: u32,
    pub predicted: f64,
    /// In [0, 1]; decays with horizon and volatility.
    pub confidence: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Full prediction output for one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct HeatForecastReport {
    pub cluster_id: String,
    pub current: f64,
    pub trend: f64,
    pub volatility: f64,
    pub momentum: f64,
    pub lifecycle: LifecycleStage,
    pub forecasts: Vec<HeatForecast>,
    pub trajectory: Trajectory,
}

/// Forecast horizons, hours ahead.
const HORIZONS: [u32; 3] = [1, 6, 24];
/// Minimum samples required for a forecast.
const MIN_WINDOW: usize = 24;

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

pub struct HeatPredictor;

impl HeatPredictor {
    /// Forecast heat for `cluster_id` from its history (most recent first).
    /// Returns `None` below [`MIN_WINDOW`] samples or on a degenerate series.
    pub fn predict(cluster_id: &str, samples: &[HeatSample]) -> Option<HeatForecastReport> {
        if samples.len() < MIN_WINDOW {
            return None;
        }

        // Oldest first for the regression.
        let series: Vec<f64> = samples.iter().rev().map(|s| s.heat_score).collect();
        let n = series.len();
        let current = series[n - 1];

        let mean = series.iter().sum::<f64>() / n as f64;
        if mean <= 0.0 {
            return None;
        }
        let variance = series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let std_dev = variance.sqrt();

        let trend = (regression_slope(&series) / mean).clamp(-1.0, 1.0);
        let volatility = std_dev / mean;

        // Momentum from the newest ten samples (newest-first input).
        let newest: f64 = samples[..5].iter().map(|s| s.heat_score).sum::<f64>() / 5.0;
        let next: f64 = samples[5..10].iter().map(|s| s.heat_score).sum::<f64>() / 5.0;
        let momentum = if next > 0.0 { (newest - next) / next } else { 0.0 };

        let lifecycle = classify_lifecycle(&series, trend);

        let forecasts: Vec<HeatForecast> = HORIZONS
            .iter()
            .map(|&h| forecast_horizon(current, trend, std_dev, volatility, momentum, lifecycle, h))
            .collect();

        let trajectory = classify_trajectory(current, &forecasts, trend, momentum);

        debug!(
            cluster_id,
            current,
            trend,
            volatility,
            momentum,
            lifecycle = ?lifecycle,
            trajectory = ?trajectory,
            "heat forecast computed"
        );

        Some(HeatForecastReport {
            cluster_id: cluster_id.to_string(),
            current,
            trend,
            volatility,
            momentum,
            lifecycle,
            forecasts,
            trajectory,
        })
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Least-squares slope over an evenly spaced series.
fn regression_slope(series: &[f64]) -> f64 {
    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Position-in-range crossed with the recent trend.
fn classify_lifecycle(series: &[f64], trend: f64) -> LifecycleStage {
    let min = series.iter().cloned().fold(f64::MAX, f64::min);
    let max = series.iter().cloned().fold(f64::MIN, f64::max);
    let position = if max > min {
        (series[series.len() - 1] - min) / (max - min)
    } else {
        0.5
    };

    if trend > 0.01 {
        if position < 0.4 {
            LifecycleStage::Emerging
        } else {
            LifecycleStage::Growing
        }
    } else if trend < -0.01 {
        LifecycleStage::Decaying
    } else if position > 0.75 {
        LifecycleStage::Peak
    } else {
        LifecycleStage::Stable
    }
}

fn stage_factor(stage: LifecycleStage, h: u32) -> f64 {
    let base: f64 = match stage {
        LifecycleStage::Emerging => 1.05,
        LifecycleStage::Growing => 1.02,
        LifecycleStage::Peak => 0.98,
        LifecycleStage::Decaying => 0.95,
        LifecycleStage::Stable => 1.0,
    };
    base.powi(h as i32)
}

fn forecast_horizon(
    current: f64,
    trend: f64,
    std_dev: f64,
    volatility: f64,
    momentum: f64,
    stage: LifecycleStage,
    h: u32,
) -> HeatForecast {
    let hf = h as f64;
    let mut predicted = current + trend * std_dev * hf * 0.5;
    predicted *= stage_factor(stage, h);
    predicted *= 1.0 + momentum * 0.1 * hf;
    predicted = predicted.max(0.0);

    let confidence = (-hf / 12.0).exp() * (-2.0 * volatility).exp();
    let half_width = 1.96 * std_dev * hf.sqrt() * (1.0 + volatility);

    HeatForecast {
        horizon_hours: h,
        predicted,
        confidence: confidence.clamp(0.0, 1.0),
        ci_lower: (predicted - half_width).max(0.0),
        ci_upper: predicted + half_width,
    }
}

fn classify_trajectory(
    current: f64,
    forecasts: &[HeatForecast],
    trend: f64,
    momentum: f64,
) -> Trajectory {
    if current <= 0.0 {
        return Trajectory::Stable;
    }
    let change = |h: u32| {
        forecasts
            .iter()
            .find(|f| f.horizon_hours == h)
            .map(|f| (f.predicted - current) / current)
            .unwrap_or(0.0)
    };
    let c1 = change(1);
    let c24 = change(24);

    if c1 > 0.20 && c24 > 0.50 {
        Trajectory::Spiking
    } else if c1 < -0.20 && c24 < -0.50 {
        Trajectory::Crashing
    } else if c1 > 0.05 || (trend > 0.1 && momentum > 0.1) {
        Trajectory::Growing
    } else if c1 < -0.05 || (trend < -0.1 && momentum < -0.1) {
        Trajectory::Decaying
    } else {
        Trajectory::Stable
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Newest-first samples from an oldest-first heat series.
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
    fn short_history_yields_none() {
        let s = samples(&[1.0; 10]);
        assert!(HeatPredictor::predict("c-1", &s).is_none());
    }

    #[test]
    fn growing_series_forecasts_growth() {
        // Twenty flat samples then an accelerating ramp: strong recent
        // momentum on top of a positive trend.
        let mut series = vec![10.0; 20];
        series.extend((1..=10).map(|i| 16.0 + i as f64 * 4.0));
        let report = HeatPredictor::predict("c-1", &samples(&series)).unwrap();

        assert!(report.trend > 0.0);
        assert!(report.momentum > 0.0);
        assert!(matches!(
            report.lifecycle,
            LifecycleStage::Growing | LifecycleStage::Emerging
        ));
        assert!(matches!(
            report.trajectory,
            Trajectory::Growing | Trajectory::Spiking
        ));
        // Forecasts grow with the horizon for a growing series.
        assert!(report.forecasts[2].predicted > report.current);
    }

    #[test]
    fn decaying_series_forecasts_decline() {
        let series: Vec<f64> = (1..=30).map(|i| 100.0 - i as f64 * 2.5).collect();
        let report = HeatPredictor::predict("c-1", &samples(&series)).unwrap();

        assert!(report.trend < 0.0);
        assert_eq!(report.lifecycle, LifecycleStage::Decaying);
        assert!(matches!(
            report.trajectory,
            Trajectory::Decaying | Trajectory::Crashing
        ));
        assert!(report.forecasts[2].predicted < report.current);
    }

    #[test]
    fn flat_series_is_stable() {
        let series: Vec<f64> = (0..30).map(|i| 50.0 + if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let report = HeatPredictor::predict("c-1", &samples(&series)).unwrap();
        assert_eq!(report.trajectory, Trajectory::Stable);
    }

    #[test]
    fn confidence_decays_with_horizon() {
        let series: Vec<f64> = (1..=30).map(|i| 10.0 + i as f64).collect();
        let report = HeatPredictor::predict("c-1", &samples(&series)).unwrap();
        assert!(report.forecasts[0].confidence > report.forecasts[1].confidence);
        assert!(report.forecasts[1].confidence > report.forecasts[2].confidence);
    }

    #[test]
    fn ci_bounds_bracket_prediction_and_clip_at_zero() {
        let series: Vec<f64> = (1..=30).map(|i| 5.0 + (i % 3) as f64).collect();
        let report = HeatPredictor::predict("c-1", &samples(&series)).unwrap();
        for f in &report.forecasts {
            assert!(f.ci_lower >= 0.0);
            assert!(f.ci_lower <= f.predicted);
            assert!(f.ci_upper >= f.predicted);
        }
    }

    #[test]
    fn forecasts_never_negative() {
        let series: Vec<f64> = (1..=30).map(|i| (30.0 - i as f64).max(0.1)).collect();
        let report = HeatPredictor::predict("c-1", &samples(&series)).unwrap();
        assert!(report.forecasts.iter().all(|f| f.predicted >= 0.0));
    }
}

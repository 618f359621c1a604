use std::time::Duration;

/// Round-trip statistics in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

impl RttStats {
    /// Summarize received round trips. No samples yields all zeros.
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let n = ms.len() as f64;

        let min = ms.iter().copied().fold(f64::INFINITY, f64::min);
        let max = ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = ms.iter().sum::<f64>() / n;
        let variance = ms.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;

        Self {
            min,
            max,
            avg,
            std_dev: variance.sqrt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_empty_samples() {
        assert_eq!(RttStats::from_samples(&[]), RttStats::default());
    }

    #[test]
    fn test_single_sample() {
        let stats = RttStats::from_samples(&[Duration::from_micros(1500)]);
        assert!(approx_eq(stats.min, 1.5));
        assert!(approx_eq(stats.max, 1.5));
        assert!(approx_eq(stats.avg, 1.5));
        assert!(approx_eq(stats.std_dev, 0.0));
    }

    #[test]
    fn test_population_std_dev() {
        let samples = [2, 4, 4, 4, 5, 5, 7, 9].map(Duration::from_millis);
        let stats = RttStats::from_samples(&samples);
        assert!(approx_eq(stats.min, 2.0));
        assert!(approx_eq(stats.max, 9.0));
        assert!(approx_eq(stats.avg, 5.0));
        assert!(approx_eq(stats.std_dev, 2.0));
    }
}

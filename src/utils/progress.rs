use std::time::{Duration, Instant};

/// Throttled speed sampler fed by transport progress callbacks.
///
/// A sample is produced at most once per `interval`; speed is the number of
/// bytes transferred since the previous sample divided by the elapsed time.
#[derive(Debug)]
pub struct ProgressSampler {
    interval: Duration,
    last_sample: Instant,
    last_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Bytes per second
    pub speed: f64,
    /// Seconds until done at `speed`, 0 when speed is 0
    pub eta_secs: f64,
}

impl ProgressSampler {
    pub fn new(interval: Duration, initial_bytes: u64) -> Self {
        Self {
            interval,
            last_sample: Instant::now(),
            last_bytes: initial_bytes,
        }
    }

    /// Returns a sample when at least `interval` passed since the last one.
    pub fn sample(&mut self, total_bytes: u64, file_size: u64) -> Option<Sample> {
        self.sample_at(Instant::now(), total_bytes, file_size)
    }

    pub fn sample_at(&mut self, now: Instant, total_bytes: u64, file_size: u64) -> Option<Sample> {
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed < self.interval {
            return None;
        }

        let transferred = total_bytes.saturating_sub(self.last_bytes);
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { transferred as f64 / secs } else { 0.0 };
        let remaining = file_size.saturating_sub(total_bytes);

        self.last_sample = now;
        self.last_bytes = total_bytes;

        Some(Sample {
            speed,
            eta_secs: estimate_eta(remaining, speed),
        })
    }

    /// Restarts the interval, e.g. after a pause.
    pub fn reset(&mut self, total_bytes: u64) {
        self.last_sample = Instant::now();
        self.last_bytes = total_bytes;
    }
}

pub fn estimate_eta(remaining_bytes: u64, speed: f64) -> f64 {
    if speed > 0.0 && speed.is_finite() {
        remaining_bytes as f64 / speed
    } else {
        0.0
    }
}

/// Percentage clamped to `[0, 100]`. An empty file counts as done.
pub fn percentage(uploaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let value = uploaded as f64 / total as f64 * 100.0;
    if value.is_finite() { value.clamp(0.0, 100.0) } else { 0.0 }
}

/// Format bytes
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Renders an ETA in seconds; zero, negative or non-finite values render as `"0s"`.
pub fn format_eta(secs: f64) -> String {
    if !secs.is_finite() || secs <= 0.0 {
        return "0s".to_string();
    }
    format_duration(Duration::from_secs_f64(secs.ceil()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_throttles() {
        let start = Instant::now();
        let mut sampler = ProgressSampler {
            interval: Duration::from_millis(100),
            last_sample: start,
            last_bytes: 0,
        };

        assert!(sampler.sample_at(start + Duration::from_millis(50), 500, 10_000).is_none());

        let sample = sampler.sample_at(start + Duration::from_millis(200), 1_000, 10_000).unwrap();
        assert!((sample.speed - 5_000.0).abs() < 1e-6);
        assert!((sample.eta_secs - 1.8).abs() < 1e-6);

        // The next interval is measured from the last emitted sample
        assert!(sampler.sample_at(start + Duration::from_millis(250), 1_500, 10_000).is_none());
    }

    #[test]
    fn test_zero_speed_has_zero_eta() {
        assert_eq!(estimate_eta(1000, 0.0), 0.0);
        assert_eq!(estimate_eta(1000, f64::NAN), 0.0);
        assert_eq!(format_eta(0.0), "0s");
        assert_eq!(format_eta(f64::INFINITY), "0s");
        assert_eq!(format_eta(61.2), "1m 2s");
    }

    #[test]
    fn test_percentage_clamped() {
        assert_eq!(percentage(0, 0), 100.0);
        assert_eq!(percentage(50, 200), 25.0);
        assert_eq!(percentage(300, 200), 100.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}

/// Utility functions and helpers for fieldbus operations
///
/// This module contains call metrics, timers, formatting helpers and the
/// test logger setup.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{FieldbusError, FieldbusResult};

/// Call metrics of one machine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
    /// Error code of the most recent failure
    pub last_error_code: Option<i32>,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    /// Record a successful operation
    pub fn record_success(&mut self, duration: Duration) {
        self.record(duration);
        self.successful_requests += 1;
    }

    /// Record a failed operation
    pub fn record_failure(&mut self, duration: Duration, error_code: i32) {
        self.record(duration);
        self.failed_requests += 1;
        self.last_error_code = Some(error_code);
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start<S: Into<String>>(operation_name: S) -> Self {
        let operation_name = operation_name.into();
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            info!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate a Modbus slave address (0 broadcast, 1-247 devices)
    pub fn validate_slave_address(slave: u8) -> FieldbusResult<()> {
        if slave > 247 {
            return Err(FieldbusError::configuration(format!(
                "Invalid slave address: {} (must be 0-247)",
                slave
            )));
        }
        Ok(())
    }

    /// Validate an S7 rack/slot pair
    pub fn validate_rack_slot(rack: u8, slot: u8) -> FieldbusResult<()> {
        if rack > 7 || slot > 31 {
            return Err(FieldbusError::configuration(format!(
                "Invalid S7 position rack {} slot {} (rack 0-7, slot 0-31)",
                rack, slot
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as spaced upper-case hex
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        let encoded = hex::encode_upper(bytes);
        let mut spaced = String::with_capacity(encoded.len() + bytes.len());
        for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
            if i > 0 {
                spaced.push(' ');
            }
            spaced.push_str(&String::from_utf8_lossy(pair));
        }
        spaced
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format performance metrics as a table
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "Performance Metrics:\n\
             ├─ Total Requests: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.success_rate(),
            metrics.failed_requests,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Install a `tracing` subscriber writing to the test harness output
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_metrics() {
        let mut metrics = PerformanceMetrics::new();

        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure(Duration::from_millis(150), 2);

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.last_error_code, Some(2));
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(metrics.avg_duration, Duration::from_millis(150));
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);

        metrics.reset();
        assert_eq!(metrics, PerformanceMetrics::default());
    }

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_address(0).is_ok());
        assert!(validation::validate_slave_address(247).is_ok());
        assert!(validation::validate_slave_address(248).is_err());

        assert!(validation::validate_rack_slot(0, 2).is_ok());
        assert!(validation::validate_rack_slot(8, 2).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x01, 0x03, 0x10, 0xFF]), "01 03 10 FF");
        assert_eq!(format::bytes_to_hex(&[]), "");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(90_000)), "1m 30.0s");

        let mut metrics = PerformanceMetrics::new();
        metrics.record_success(Duration::from_millis(20));
        assert!(format::format_metrics(&metrics).contains("Successful: 1 (100.0%)"));
    }
}

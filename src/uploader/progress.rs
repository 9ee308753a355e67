//! Progress reporting for uploads with byte-level tracking and speed
//! calculation.

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Progress update information sent to callbacks
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Total bytes expected for the current file
    pub total_size: u64,
    /// Bytes acknowledged by the cloud service so far
    pub uploaded: u64,
    /// Progress fraction (0.0 - 1.0)
    pub progress: f64,
    /// Current upload speed in bytes per second
    pub speed_bytes_per_sec: u64,
    /// Estimated time remaining in seconds (None if speed is 0)
    pub eta_seconds: Option<u64>,
}

impl ProgressUpdate {
    pub fn new(total_size: u64, uploaded: u64, speed_bytes_per_sec: u64) -> Self {
        let progress = if total_size > 0 {
            (uploaded as f64 / total_size as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let eta_seconds = if speed_bytes_per_sec > 0 && uploaded < total_size {
            Some((total_size - uploaded) / speed_bytes_per_sec)
        } else {
            None
        };

        Self {
            total_size,
            uploaded,
            progress,
            speed_bytes_per_sec,
            eta_seconds,
        }
    }
}

/// Format bytes into a human-readable string (e.g., "10.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn format_eta(eta_seconds: Option<u64>) -> String {
    match eta_seconds {
        None => "N/A".to_string(),
        Some(secs) => {
            let hours = secs / 3600;
            let minutes = (secs % 3600) / 60;
            let seconds = secs % 60;

            if hours > 0 {
                format!("{hours}h {minutes}m {seconds}s")
            } else if minutes > 0 {
                format!("{minutes}m {seconds}s")
            } else {
                format!("{seconds}s")
            }
        }
    }
}

/// Trait for receiving progress updates
pub trait ProgressCallback: Send + Sync {
    /// Called when a new file starts uploading
    fn on_file_start(&self, _remote_path: &str, _total_size: u64) {}

    /// Called when upload progress changes
    fn on_progress(&self, update: ProgressUpdate);

    /// Called when the current file finishes
    fn on_file_done(&self, _remote_path: &str) {}
}

/// No-op progress callback implementation
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _update: ProgressUpdate) {}
}

/// Speed calculator using a sliding window
struct SpeedCalculator {
    samples: Vec<(Instant, u64)>,
    window_duration: Duration,
}

impl SpeedCalculator {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(32),
            window_duration: Duration::from_secs(10),
        }
    }

    fn record_and_calculate(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        self.samples.push((now, total_bytes));

        let cutoff = now - self.window_duration;
        self.samples.retain(|(t, _)| *t >= cutoff);

        if self.samples.len() >= 2 {
            let (oldest_time, oldest_bytes) = self.samples.first().unwrap();
            let elapsed = now.duration_since(*oldest_time);
            if elapsed.as_millis() > 0 {
                let bytes_diff = total_bytes.saturating_sub(*oldest_bytes);
                return (bytes_diff as f64 / elapsed.as_secs_f64()) as u64;
            }
        }

        0
    }
}

/// Byte-level tracker for the sequential pipeline
pub struct ProgressTracker {
    total_size: u64,
    uploaded: u64,
    speed_calc: SpeedCalculator,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            uploaded: 0,
            speed_calc: SpeedCalculator::new(),
        }
    }

    /// Record acknowledged bytes and produce an update for the callback
    pub fn advance(&mut self, bytes: u64) -> ProgressUpdate {
        self.uploaded += bytes;
        let speed = self.speed_calc.record_and_calculate(self.uploaded);
        ProgressUpdate::new(self.total_size, self.uploaded, speed)
    }
}

/// Console reporter: one line per file, redrawn in place and throttled
pub struct ConsoleProgress {
    state: Mutex<ConsoleState>,
}

struct ConsoleState {
    last_print: Option<Instant>,
    current_file: String,
}

const PRINT_INTERVAL: Duration = Duration::from_secs(2);

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConsoleState {
                last_print: None,
                current_file: String::new(),
            }),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for ConsoleProgress {
    fn on_file_start(&self, remote_path: &str, total_size: u64) {
        let mut state = self.state.lock().unwrap();
        state.current_file = remote_path.to_string();
        state.last_print = None;
        eprintln!("Uploading {remote_path} ({})", format_bytes(total_size));
    }

    fn on_progress(&self, update: ProgressUpdate) {
        let mut state = self.state.lock().unwrap();
        let due = state
            .last_print
            .is_none_or(|t| t.elapsed() >= PRINT_INTERVAL);
        if !due {
            return;
        }
        state.last_print = Some(Instant::now());

        eprint!(
            "\r  {:.1}% ({} / {}) @ {}/s | ETA: {}    ",
            update.progress * 100.0,
            format_bytes(update.uploaded),
            format_bytes(update.total_size),
            format_bytes(update.speed_bytes_per_sec),
            format_eta(update.eta_seconds),
        );
        let _ = std::io::stderr().flush();
    }

    fn on_file_done(&self, remote_path: &str) {
        drop(self.state.lock().unwrap());
        eprintln!("\r  done: {remote_path}                                    ");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_byte_magnitudes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn update_clamps_and_computes_eta() {
        let update = ProgressUpdate::new(1000, 250, 50);
        assert!((update.progress - 0.25).abs() < f64::EPSILON);
        assert_eq!(update.eta_seconds, Some(15));

        let done = ProgressUpdate::new(0, 0, 0);
        assert!((done.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(done.eta_seconds, None);
    }

    #[test]
    fn tracker_accumulates_acknowledged_bytes() {
        let mut tracker = ProgressTracker::new(300);
        let u1 = tracker.advance(100);
        assert_eq!(u1.uploaded, 100);
        let u2 = tracker.advance(200);
        assert_eq!(u2.uploaded, 300);
        assert!((u2.progress - 1.0).abs() < f64::EPSILON);
    }
}

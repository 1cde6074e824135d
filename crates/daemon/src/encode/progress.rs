//! Encoder progress parsing.
//!
//! ffmpeg run with `-progress pipe:2` writes `key=value` lines
//! (`out_time_us`, `out_time_ms`, `out_time`) to stderr, interleaved with the
//! regular `... time=HH:MM:SS.xx ...` stats lines. Either form is accepted.

/// Position in seconds reported by one line of encoder output, if any.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            // ffmpeg reports out_time_ms in microseconds as well
            "out_time_us" | "out_time_ms" => {
                return value
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|us| *us >= 0)
                    .map(|us| us as f64 / 1_000_000.0);
            }
            "out_time" => return parse_timestamp(value.trim()),
            _ => {}
        }
    }

    let start = line.find("time=")? + "time=".len();
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    parse_timestamp(&rest[..end])
}

/// Parse `HH:MM:SS(.fraction)`.
fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Turns encoder positions into percentages of the source duration.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_secs: f64,
    last_percent: f32,
}

impl ProgressTracker {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            last_percent: 0.0,
        }
    }

    /// New percentage for `line`, if it moved forward by at least a tenth of
    /// a percent. Always `None` when the duration is unknown.
    pub fn observe(&mut self, line: &str) -> Option<f32> {
        if self.duration_secs <= 0.0 {
            return None;
        }
        let position = parse_progress_line(line)?;
        let percent = ((position / self.duration_secs) * 100.0).clamp(0.0, 100.0) as f32;
        if percent - self.last_percent >= 0.1 {
            self.last_percent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_keys() {
        assert_eq!(parse_progress_line("out_time_us=1500000"), Some(1.5));
        assert_eq!(parse_progress_line("out_time_ms=2000000"), Some(2.0));
        assert_eq!(parse_progress_line("out_time=00:01:30.500000"), Some(90.5));
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("bitrate=1234.5kbits/s"), None);
    }

    #[test]
    fn test_stats_line() {
        let line = "frame= 1200 fps= 48 q=28.0 size=   10240kB time=00:00:50.04 bitrate=1676.3kbits/s speed=1.9x";
        let secs = parse_progress_line(line).unwrap();
        assert!((secs - 50.04).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_lines() {
        assert_eq!(parse_progress_line(""), None);
        assert_eq!(parse_progress_line("Press [q] to stop"), None);
        assert_eq!(parse_progress_line("time=garbage"), None);
    }

    #[test]
    fn test_tracker_percentages() {
        let mut tracker = ProgressTracker::new(100.0);
        assert_eq!(tracker.observe("out_time=00:00:25.000000"), Some(25.0));
        // Same position is not reported twice
        assert_eq!(tracker.observe("out_time=00:00:25.000000"), None);
        assert_eq!(tracker.observe("out_time=00:03:00.000000"), Some(100.0));
    }

    #[test]
    fn test_tracker_without_duration() {
        let mut tracker = ProgressTracker::new(0.0);
        assert_eq!(tracker.observe("out_time_us=1000000"), None);
    }
}

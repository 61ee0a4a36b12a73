//! Stage progress reporting.
//!
//! Stages report progress through a [`StageProgress`], a throttled updater
//! that emits at most one event per interval (2 s by default) and is a
//! no-op when constructed without a sink. Sinks write to **stderr** so
//! stdout stays parseable: the CLI prints the stage output JSON there.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub stage: &'static str,
    /// Overall completion in `[0, 100]`.
    pub pct: u8,
    pub message: String,
    /// `(done, total)` when the update came from a counted range.
    pub counts: Option<(u64, u64)>,
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "concept_graph_build  42%  inventory  12 / 40".
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let counts = match event.counts {
            Some((done, total)) => format!("  {} / {}", format_number(done), format_number(total)),
            None => String::new(),
        };
        let line = format!("{}  {:>3}%  {}{}\n", event.stage, event.pct, event.message, counts);
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let mut obj = serde_json::json!({
            "event": "progress",
            "stage": event.stage,
            "pct": event.pct,
            "message": event.message,
        });
        if let Some((done, total)) = event.counts {
            obj["done"] = done.into();
            obj["total"] = total.into();
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// `None` for [`ProgressMode::Off`], so stages skip formatting entirely.
    pub fn sink(&self) -> Option<Arc<dyn ProgressSink>> {
        match self {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(Arc::new(StderrProgress)),
            ProgressMode::Json => Some(Arc::new(JsonProgress)),
        }
    }
}

/// Throttled per-stage progress updater.
pub struct StageProgress {
    stage: &'static str,
    sink: Option<Arc<dyn ProgressSink>>,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl StageProgress {
    pub fn new(stage: &'static str, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self {
            stage,
            sink,
            interval: DEFAULT_INTERVAL,
            last_emit: Mutex::new(None),
        }
    }

    pub fn disabled(stage: &'static str) -> Self {
        Self::new(stage, None)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn update(&self, pct: u8, message: &str) {
        self.emit(pct.min(100), message, None);
    }

    /// Map `done / total` linearly onto `[start, end]` percent.
    pub fn update_range(&self, done: u64, total: u64, start: u8, end: u8, message: &str) {
        let pct = range_pct(done, total, start, end);
        self.emit(pct, message, Some((done, total)));
    }

    fn emit(&self, pct: u8, message: &str, counts: Option<(u64, u64)>) {
        let Some(sink) = &self.sink else {
            return;
        };
        // Completion always goes through so the final state is visible.
        if pct < 100 {
            let Ok(mut last) = self.last_emit.lock() else {
                return;
            };
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.interval {
                    return;
                }
            }
            *last = Some(now);
        }
        sink.report(&ProgressEvent {
            stage: self.stage,
            pct,
            message: message.to_string(),
            counts,
        });
    }
}

fn range_pct(done: u64, total: u64, start: u8, end: u8) -> u8 {
    let (start, end) = (start.min(100), end.min(100).max(start.min(100)));
    if total == 0 {
        return end;
    }
    let frac = done.min(total) as f64 / total as f64;
    (start as f64 + (end - start) as f64 * frac).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Collect {
        fn report(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn updates_are_throttled_but_completion_is_not() {
        let sink = Arc::new(Collect::default());
        let progress = StageProgress::new("embed_chunks", Some(sink.clone() as Arc<dyn ProgressSink>))
            .with_interval(Duration::from_secs(60));
        progress.update(10, "a");
        progress.update(20, "b");
        progress.update(100, "done");
        let events = sink.0.lock().unwrap();
        let pcts: Vec<u8> = events.iter().map(|e| e.pct).collect();
        assert_eq!(pcts, vec![10, 100]);
    }

    #[test]
    fn range_maps_linearly() {
        assert_eq!(range_pct(0, 10, 20, 60), 20);
        assert_eq!(range_pct(5, 10, 20, 60), 40);
        assert_eq!(range_pct(20, 10, 20, 60), 60);
        assert_eq!(range_pct(0, 0, 20, 60), 60);
    }

    #[test]
    fn disabled_progress_is_noop() {
        let progress = StageProgress::disabled("x");
        progress.update(50, "nothing happens");
        progress.update_range(1, 2, 0, 100, "still nothing");
    }
}

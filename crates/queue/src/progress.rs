//! Progress decoding for the encode engine.
//!
//! The engine reports progress in one of two shapes:
//!
//! - CLI text on stdout, one status per line (lines are usually terminated
//!   with `\r` rather than `\n`):
//!   `Encoding: task 1 of 2, 45.67 % (23.45 fps, avg 24.56 fps, ETA 00h12m34s)`
//! - JSON state documents from the in-process engine:
//!   `{"State":"WORKING","Working":{"Progress":0.4567,"Pass":1,"PassCount":2,...}}`
//!
//! [`ProgressDecoder`] turns either into [`ProgressSample`]s. Unknown or
//! garbled input is ignored. [`ProgressTracker`] sits between the decoder and
//! listeners and enforces per-pass monotonic percent and the late-sample drop.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// What the engine is doing while reporting progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodePhase {
    Encoding,
    /// Looking for the start point before a ranged encode.
    Searching,
    Muxing,
    /// Foreign-audio subtitle scan pass.
    SubtitleScan,
}

/// One decoded progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// 1-based pass index.
    pub task_index: u32,
    pub task_count: u32,
    /// Percent of the current pass, 0-100.
    pub percent: f32,
    pub current_fps: Option<f32>,
    pub average_fps: Option<f32>,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub phase: EncodePhase,
}

impl ProgressSample {
    pub fn is_searching(&self) -> bool {
        self.phase == EncodePhase::Searching
    }

    pub fn is_muxing(&self) -> bool {
        self.phase == EncodePhase::Muxing
    }

    pub fn is_subtitle_scan(&self) -> bool {
        self.phase == EncodePhase::SubtitleScan
    }

    /// Percent of the whole job, assuming equally weighted passes.
    pub fn overall_percent(&self) -> f32 {
        if self.task_count == 0 {
            return self.percent;
        }
        let done = self.task_index.saturating_sub(1) as f32;
        ((done * 100.0 + self.percent) / self.task_count as f32).clamp(0.0, 100.0)
    }
}

/// State reported by the in-process engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Progress(ProgressSample),
    Paused,
    /// Work finished; `error_code` 0 means success.
    WorkDone { error_code: i32 },
    /// Idle, scanning and other states that carry no encode progress.
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonState {
    state: String,
    working: Option<JsonWorking>,
    searching: Option<JsonWorking>,
    muxing: Option<JsonWorking>,
    work_done: Option<JsonWorkDone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonWorking {
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    rate: f64,
    #[serde(default)]
    rate_avg: f64,
    #[serde(default = "unknown_eta_part")]
    hours: i64,
    #[serde(default = "unknown_eta_part")]
    minutes: i64,
    #[serde(default = "unknown_eta_part")]
    seconds: i64,
    #[serde(default = "first_pass")]
    pass: u32,
    #[serde(default = "first_pass")]
    pass_count: u32,
    #[serde(rename = "PassID", default)]
    pass_id: i32,
}

fn unknown_eta_part() -> i64 {
    -1
}

fn first_pass() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonWorkDone {
    #[serde(default)]
    error: i32,
}

/// Pass id the engine uses for the subtitle scan pass.
const SUBTITLE_SCAN_PASS_ID: i32 = -1;

/// Unterminated output longer than this is no status line and is discarded.
const MAX_PENDING_STATUS: usize = 4096;

/// Streaming decoder for one encode operation.
#[derive(Debug)]
pub struct ProgressDecoder {
    pending: String,
    started: Instant,
    last_pass: (u32, u32),
}

impl Default for ProgressDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDecoder {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            started: Instant::now(),
            last_pass: (1, 1),
        }
    }

    /// Feed a raw chunk of CLI output. Incomplete trailing text is kept until
    /// the next chunk or [`finish`](Self::finish), up to a bounded length.
    pub fn feed(&mut self, chunk: &str) -> Vec<ProgressSample> {
        self.pending.push_str(chunk);
        let mut samples = Vec::new();
        while let Some(pos) = self.pending.find(['\r', '\n']) {
            let line: String = self.pending.drain(..=pos).collect();
            if let Some(sample) = self.decode_line(&line) {
                samples.push(sample);
            }
        }
        if self.pending.len() > MAX_PENDING_STATUS {
            self.pending.clear();
        }
        samples
    }

    /// Decode whatever is left in the buffer once the stream has closed.
    pub fn finish(&mut self) -> Option<ProgressSample> {
        let rest = std::mem::take(&mut self.pending);
        self.decode_line(&rest)
    }

    /// Decode one complete CLI status line.
    pub fn decode_line(&mut self, line: &str) -> Option<ProgressSample> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.starts_with("Muxing") {
            let (task_index, task_count) = self.last_pass;
            return Some(self.sample(task_index, task_count, 100.0, EncodePhase::Muxing));
        }
        let rest = line.strip_prefix("Encoding:")?.trim_start();
        let rest = rest.strip_prefix("task")?.trim_start();
        let (index_text, rest) = rest.split_once(" of ")?;
        let task_index: u32 = index_text.trim().parse().ok()?;
        let count_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let task_count: u32 = rest[..count_end].parse().ok()?;
        if task_index == 0 || task_count == 0 || task_index > task_count {
            return None;
        }
        let rest = &rest[count_end..];

        let phase = if rest.contains("Searching for start time") {
            EncodePhase::Searching
        } else if rest.contains("subtitle scan") {
            EncodePhase::SubtitleScan
        } else {
            EncodePhase::Encoding
        };
        let percent = parse_percent(rest)?;

        self.last_pass = (task_index, task_count);
        let mut sample = self.sample(task_index, task_count, percent, phase);
        if let Some(stats) = rest
            .split_once('(')
            .and_then(|(_, tail)| tail.split_once(')'))
            .map(|(inner, _)| inner)
        {
            apply_rate_block(stats, &mut sample);
        }
        Some(sample)
    }

    /// Decode one JSON state document from the in-process engine.
    ///
    /// Returns `None` for documents that do not parse.
    pub fn decode_json(&mut self, document: &str) -> Option<EngineStatus> {
        let state: JsonState = serde_json::from_str(document).ok()?;
        let status = match state.state.as_str() {
            "WORKING" => {
                let working = state.working?;
                let phase = if working.pass_id == SUBTITLE_SCAN_PASS_ID {
                    EncodePhase::SubtitleScan
                } else {
                    EncodePhase::Encoding
                };
                EngineStatus::Progress(self.json_sample(&working, phase)?)
            }
            "SEARCHING" => {
                let searching = state.searching.or(state.working)?;
                EngineStatus::Progress(self.json_sample(&searching, EncodePhase::Searching)?)
            }
            "MUXING" => {
                let (task_index, task_count) = self.last_pass;
                let percent = state
                    .muxing
                    .map(|m| (m.progress * 100.0) as f32)
                    .unwrap_or(100.0);
                EngineStatus::Progress(self.sample(
                    task_index,
                    task_count,
                    percent.clamp(0.0, 100.0),
                    EncodePhase::Muxing,
                ))
            }
            "PAUSED" => EngineStatus::Paused,
            "WORKDONE" => EngineStatus::WorkDone {
                error_code: state.work_done.map(|w| w.error).unwrap_or(0),
            },
            _ => EngineStatus::Other,
        };
        Some(status)
    }

    fn json_sample(&mut self, working: &JsonWorking, phase: EncodePhase) -> Option<ProgressSample> {
        let percent = (working.progress * 100.0) as f32;
        if !percent.is_finite() {
            return None;
        }
        let task_count = working.pass_count.max(1);
        let task_index = working.pass.clamp(1, task_count);
        self.last_pass = (task_index, task_count);

        let mut sample = self.sample(task_index, task_count, percent.clamp(0.0, 100.0), phase);
        sample.current_fps = positive(working.rate as f32);
        sample.average_fps = positive(working.rate_avg as f32);
        sample.eta = eta_from_parts(working.hours, working.minutes, working.seconds);
        Some(sample)
    }

    fn sample(&self, task_index: u32, task_count: u32, percent: f32, phase: EncodePhase) -> ProgressSample {
        ProgressSample {
            task_index,
            task_count,
            percent,
            current_fps: None,
            average_fps: None,
            eta: None,
            elapsed: self.started.elapsed(),
            phase,
        }
    }
}

/// Percent value preceding the first `%` sign.
fn parse_percent(text: &str) -> Option<f32> {
    let (before, _) = text.split_once('%')?;
    let token = before
        .trim_end()
        .rsplit(|c: char| c.is_whitespace() || c == ',')
        .next()?;
    let percent: f32 = token.parse().ok()?;
    if !percent.is_finite() {
        return None;
    }
    Some(percent.clamp(0.0, 100.0))
}

/// Parses `23.45 fps, avg 24.56 fps, ETA 00h12m34s`.
fn apply_rate_block(block: &str, sample: &mut ProgressSample) {
    for part in block.split(',').map(str::trim) {
        if let Some(eta) = part.strip_prefix("ETA") {
            sample.eta = parse_eta(eta.trim());
        } else if let Some(avg) = part.strip_prefix("avg") {
            sample.average_fps = parse_fps(avg);
        } else if part.ends_with("fps") {
            sample.current_fps = parse_fps(part);
        }
    }
}

fn parse_fps(text: &str) -> Option<f32> {
    text.trim()
        .trim_end_matches("fps")
        .trim()
        .parse::<f32>()
        .ok()
        .and_then(positive)
}

/// Parses `00h12m34s`.
fn parse_eta(text: &str) -> Option<Duration> {
    let (hours, rest) = text.split_once('h')?;
    let (minutes, rest) = rest.split_once('m')?;
    let seconds = rest.strip_suffix('s')?;
    eta_from_parts(
        hours.parse().ok()?,
        minutes.parse().ok()?,
        seconds.parse().ok()?,
    )
}

fn eta_from_parts(hours: i64, minutes: i64, seconds: i64) -> Option<Duration> {
    if hours < 0 || minutes < 0 || seconds < 0 {
        return None;
    }
    let total = hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;
    Some(Duration::from_secs(total as u64))
}

fn positive(value: f32) -> Option<f32> {
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Filters decoded samples for one job before they reach listeners.
///
/// Percent never goes backwards within a pass; a new pass resets it. After
/// [`mark_completed`](Self::mark_completed) every sample is dropped.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    completed: bool,
    last_pass: Option<(u32, u32)>,
    last_percent: f32,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, mut sample: ProgressSample) -> Option<ProgressSample> {
        if self.completed {
            return None;
        }
        let pass = (sample.task_index, sample.task_count);
        if self.last_pass == Some(pass) {
            sample.percent = sample.percent.max(self.last_percent);
        }
        self.last_pass = Some(pass);
        self.last_percent = sample.percent;
        Some(sample)
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

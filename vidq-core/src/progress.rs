use regex::Regex;
use serde::Serialize;

/// Sub-stream currently being fetched by the extractor. The tool restarts
/// its own 0-100% counter for each one, so raw percentages must be rescaled
/// before they are usable as overall job progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unknown,
    Video,
    Audio,
    Merge,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Unknown => "downloading",
            Stage::Video => "[1/3] downloading video",
            Stage::Audio => "[2/3] downloading audio",
            Stage::Merge => "[3/3] merging",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub label: String,
}

/// Maps per-stream extractor progress onto a single non-decreasing 0-100
/// scale. Stage transitions are driven either by explicit hints on progress
/// events or by textual markers sniffed from the tool's diagnostic output;
/// the markers are best-effort and stages only ever move forward.
#[derive(Debug)]
pub struct ProgressNormalizer {
    stage: Stage,
    last_percent: u8,
    destinations_seen: u32,
    destination_marker: Regex,
    merge_marker: Regex,
}

impl Default for ProgressNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNormalizer {
    pub fn new() -> Self {
        Self {
            stage: Stage::Unknown,
            last_percent: 0,
            destinations_seen: 0,
            destination_marker: Regex::new(r"\[download\]\s+Destination:").expect("static regex"),
            merge_marker: Regex::new(r"\[Merger\]|Merging formats").expect("static regex"),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn normalize(&mut self, raw_percent: f64, hint: Option<Stage>) -> ProgressUpdate {
        if let Some(stage) = hint {
            self.advance_to(stage);
        }
        let raw = raw_percent.clamp(0.0, 100.0);
        let scaled = match self.stage {
            Stage::Video => raw * 0.8,
            Stage::Audio => 80.0 + raw * 0.2,
            Stage::Merge => 100.0,
            Stage::Unknown => raw,
        };
        let percent = (scaled.round() as u8).max(self.last_percent);
        self.last_percent = percent;
        ProgressUpdate {
            percent,
            label: self.stage.label().to_string(),
        }
    }

    /// Heuristic stage detection from the tool's own diagnostic lines: a
    /// second destination announcement means the audio stream is starting,
    /// a merger announcement means the final merge step. Tools that fetch a
    /// single stream never print either and stay in video/unknown.
    pub fn observe_line(&mut self, line: &str) {
        if self.merge_marker.is_match(line) {
            self.advance_to(Stage::Merge);
            return;
        }
        if self.destination_marker.is_match(line) {
            self.destinations_seen += 1;
            if self.destinations_seen >= 2 {
                self.advance_to(Stage::Audio);
            } else {
                self.advance_to(Stage::Video);
            }
        }
    }

    fn advance_to(&mut self, stage: Stage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }
}

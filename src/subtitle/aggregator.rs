// SPDX-License-Identifier: GPL-2.0-or-later

use common::subtitle::SubtitleItem;

pub const DEFAULT_GAP_TOLERANCE: u32 = 5;

/// Two texts are the same caption when their normalized similarity exceeds
/// this ratio.
const SIMILARITY_THRESH: f64 = 0.6;

fn is_similar(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    strsim::normalized_levenshtein(a, b) > SIMILARITY_THRESH
}

/// The event currently being tracked.
struct OpenEvent {
    text: String,
    start: f64,
    end: f64,
    max_conf: f32,
    gap_frames: u32,
}

impl OpenEvent {
    fn extend(&mut self, text: &str, end: f64, conf: f32) {
        self.end = end;
        self.gap_frames = 0;
        if conf > self.max_conf
            || ((conf - self.max_conf).abs() < f32::EPSILON && text.len() > self.text.len())
        {
            self.text = text.to_owned();
        }
        self.max_conf = self.max_conf.max(conf);
    }
}

pub type CommitFn = Box<dyn FnMut(&SubtitleItem) + Send>;

/// Merges continuous per-frame OCR results into discrete subtitle cues.
/// Results must arrive in strictly increasing timestamp order. The commit
/// handle fires synchronously whenever a cue is closed.
pub struct SubtitleAggregator {
    items: Vec<SubtitleItem>,
    active: Option<OpenEvent>,
    min_conf: f32,
    gap_tolerance: u32,
    frame_duration: f64,
    on_commit: CommitFn,
}

impl SubtitleAggregator {
    #[must_use]
    pub fn new(min_conf: f32, fps: f64, on_commit: CommitFn) -> Self {
        Self::with_gap_tolerance(min_conf, fps, DEFAULT_GAP_TOLERANCE, on_commit)
    }

    #[must_use]
    pub fn with_gap_tolerance(
        min_conf: f32,
        fps: f64,
        gap_tolerance: u32,
        on_commit: CommitFn,
    ) -> Self {
        let frame_duration = if fps > 0.0 { 1.0 / fps } else { 0.04 };
        Self {
            items: Vec::new(),
            active: None,
            min_conf,
            gap_tolerance,
            frame_duration,
            on_commit,
        }
    }

    pub fn add_result(&mut self, text: &str, conf: f32, timestamp: f64) {
        let valid = !text.is_empty() && conf >= self.min_conf;
        let frame_end = timestamp + self.frame_duration;

        if valid {
            match &mut self.active {
                Some(event) if is_similar(&event.text, text) => {
                    event.extend(text, frame_end, conf);
                }
                Some(_) => {
                    self.commit();
                    self.open(text, timestamp, frame_end, conf);
                }
                None => self.open(text, timestamp, frame_end, conf),
            }
        } else if let Some(event) = &mut self.active {
            event.gap_frames += 1;
            if event.gap_frames > self.gap_tolerance {
                self.commit();
            }
        }
    }

    /// Flushes any open event and returns the committed cues with dense
    /// 1-based ids.
    #[must_use]
    pub fn finalize(mut self) -> Vec<SubtitleItem> {
        self.commit();
        self.items
    }

    fn open(&mut self, text: &str, start: f64, end: f64, conf: f32) {
        self.active = Some(OpenEvent {
            text: text.to_owned(),
            start,
            end,
            max_conf: conf,
            gap_frames: 0,
        });
    }

    fn commit(&mut self) {
        let Some(event) = self.active.take() else {
            return;
        };
        let item = SubtitleItem {
            id: u32::try_from(self.items.len() + 1).unwrap_or(u32::MAX),
            start: event.start,
            end: event.end,
            text: event.text,
            conf: event.max_conf,
        };
        self.items.push(item);
        let item = self.items.last().expect("just pushed");
        (self.on_commit)(item);
    }
}

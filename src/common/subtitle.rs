// SPDX-License-Identifier: GPL-2.0-or-later

use serde::{Deserialize, Serialize};

/// One committed subtitle cue. Ids are dense and 1-based within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubtitleItem {
    pub id: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub conf: f32,
}

impl SubtitleItem {
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

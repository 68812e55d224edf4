// SPDX-License-Identifier: GPL-2.0-or-later

mod aggregator;
pub mod srt;

pub use aggregator::{CommitFn, SubtitleAggregator, DEFAULT_GAP_TOLERANCE};

// SPDX-License-Identifier: GPL-2.0-or-later

use common::subtitle::SubtitleItem;
use std::{io::Write, path::Path};
use thiserror::Error;

/// Formats seconds as `HH:MM:SS,mmm`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        ms
    )
}

/// Renders cues as an SRT document. UTF-8, LF line endings, no BOM.
#[must_use]
pub fn format_srt(items: &[SubtitleItem]) -> String {
    let mut out = String::new();
    for item in items {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            item.id,
            format_timestamp(item.start),
            format_timestamp(item.end),
            item.text
        ));
    }
    out
}

#[derive(Debug, Error)]
pub enum WriteSrtError {
    #[error("create file: {0}")]
    CreateFile(std::io::Error),

    #[error("write file: {0}")]
    WriteFile(std::io::Error),
}

pub fn write_srt(path: &Path, items: &[SubtitleItem]) -> Result<(), WriteSrtError> {
    use WriteSrtError::*;
    let mut file = std::fs::File::create(path).map_err(CreateFile)?;
    file.write_all(format_srt(items).as_bytes())
        .map_err(WriteFile)
}

/// Parses SRT content. Line endings are normalized first; one leading
/// HTML-like markup layer is stripped from the text; blocks that fail to
/// parse are discarded. Imported cues get `conf = 1.0`.
#[must_use]
pub fn parse_srt(content: &str) -> Vec<SubtitleItem> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");

    let mut items = Vec::new();
    for block in normalized.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if let Some(item) = parse_block(block) {
            items.push(item);
        }
    }
    items
}

fn parse_block(block: &str) -> Option<SubtitleItem> {
    let mut lines = block.lines();
    let id: u32 = lines.next()?.trim().parse().ok()?;

    let timing = lines.next()?;
    let (start_str, end_str) = timing.split_once(" --> ")?;
    let start = parse_timestamp(start_str.trim())?;
    let end = parse_timestamp(end_str.trim())?;

    let text = lines.collect::<Vec<_>>().join("\n");
    let text = strip_tags(text.trim());
    Some(SubtitleItem {
        id,
        start,
        end,
        text,
        conf: 1.0,
    })
}

fn parse_timestamp(s: &str) -> Option<f64> {
    // HH:MM:SS,mmm
    let (hms, ms) = s.split_once(',')?;
    let mut parts = hms.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || ms.len() != 3 {
        return None;
    }
    let millis: u64 = ms.parse().ok()?;
    #[allow(clippy::cast_precision_loss)]
    let total = (hours * 3600 + minutes * 60 + seconds) as f64 + millis as f64 / 1000.0;
    Some(total)
}

/// Removes `<tag>`-style markup so text width estimation sees plain glyphs.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0u32;
    for c in text.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn item(id: u32, start: f64, end: f64, text: &str) -> SubtitleItem {
        SubtitleItem {
            id,
            start,
            end,
            text: text.to_owned(),
            conf: 1.0,
        }
    }

    #[test_case(0.0, "00:00:00,000")]
    #[test_case(3726.045, "01:02:06,045")]
    #[test_case(59.9996, "00:01:00,000"; "rounds_up")]
    fn timestamp_format(seconds: f64, want: &str) {
        assert_eq!(want, format_timestamp(seconds));
    }

    #[test]
    fn format_shape() {
        let srt = format_srt(&[item(1, 2.0, 3.5, "hello")]);
        assert_eq!("1\n00:00:02,000 --> 00:00:03,500\nhello\n\n", srt);
    }

    #[test]
    fn round_trip() {
        let items = vec![
            item(1, 0.25, 1.5, "first line"),
            item(2, 2.0, 4.123, "second\nmultiline"),
        ];
        let parsed = parse_srt(&format_srt(&items));
        assert_eq!(items.len(), parsed.len());
        for (a, b) in items.iter().zip(&parsed) {
            assert_eq!(a.id, b.id);
            assert!((a.start - b.start).abs() < 0.001);
            assert!((a.end - b.end).abs() < 0.001);
            assert_eq!(a.text, b.text);
        }
    }

    #[test]
    fn crlf_normalized_and_tags_stripped() {
        let content = "1\r\n00:00:01,000 --> 00:00:02,000\r\n<i>styled</i> text\r\n\r\n";
        let parsed = parse_srt(content);
        assert_eq!(1, parsed.len());
        assert_eq!("styled text", parsed[0].text);
    }

    #[test]
    fn bad_block_discarded() {
        let content = "\
1
00:00:01,000 --> 00:00:02,000
good

not-a-number
00:00:03,000 --> 00:00:04,000
bad

3
broken timing line
bad

4
00:00:05,000 --> 00:00:06,000
also good

";
        let parsed = parse_srt(content);
        assert_eq!(2, parsed.len());
        assert_eq!("good", parsed[0].text);
        assert_eq!("also good", parsed[1].text);
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.srt");
        write_srt(&path, &[item(1, 1.0, 2.0, "x")]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.starts_with('\u{feff}'), "no BOM expected");
        assert_eq!(1, parse_srt(&content).len());
    }
}

// SPDX-License-Identifier: GPL-2.0-or-later

use image::RgbImage;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Recognition result in one fixed shape: parallel slices of texts, scores
/// and bounding quadrilaterals. Whatever the inference library returns is
/// converted into this before leaving the adapter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recognition {
    pub texts: Vec<String>,
    pub scores: Vec<f32>,
    pub boxes: Vec<[[f32; 2]; 4]>,
}

#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("inference: {0}")]
    Inference(String),
}

/// The pluggable inference engine. Implementations are not expected to be
/// thread safe; `OcrEngine` serializes all access.
pub trait TextRecognizer: Send {
    fn recognize(&mut self, frame: &RgbImage) -> Result<Recognition, RecognizeError>;
}

pub type DynRecognizer = Box<dyn TextRecognizer + Send>;

/// Recognizer that never finds text. Stands in when no inference backend is
/// linked, keeping the pipeline runnable.
pub struct NoopRecognizer;

impl TextRecognizer for NoopRecognizer {
    fn recognize(&mut self, _: &RgbImage) -> Result<Recognition, RecognizeError> {
        Ok(Recognition::default())
    }
}

/// One inference engine instance. The internal lock guarantees two callers
/// never enter the native inference concurrently.
pub struct OcrEngine {
    recognizer: Mutex<DynRecognizer>,
}

impl OcrEngine {
    #[must_use]
    pub fn new(recognizer: DynRecognizer) -> Arc<Self> {
        Arc::new(Self {
            recognizer: Mutex::new(recognizer),
        })
    }

    /// Runs the whole batch under the inference lock. A failed frame yields
    /// a `None` slot instead of failing the batch.
    #[must_use]
    pub fn predict_batch(&self, frames: &[RgbImage]) -> Vec<Option<Recognition>> {
        if frames.is_empty() {
            return Vec::new();
        }
        let mut recognizer = self
            .recognizer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        frames
            .iter()
            .map(|frame| recognizer.recognize(frame).ok())
            .collect()
    }
}

/// Filters and orders recognized boxes into a single line of text.
/// Boxes below `conf_thresh` or with empty text are dropped; survivors are
/// sorted top to bottom by the vertical midpoint of their quadrilateral
/// (stable on ties) and joined with single spaces. The confidence is the
/// mean of the surviving scores.
#[must_use]
pub fn parse_recognition(raw: Option<&Recognition>, conf_thresh: f32) -> (String, f32) {
    let Some(raw) = raw else {
        return (String::new(), 0.0);
    };

    let mut survivors: Vec<(f32, &str, f32)> = Vec::new();
    for (i, text) in raw.texts.iter().enumerate() {
        let text = text.trim();
        let score = raw.scores.get(i).copied().unwrap_or(0.0);
        if score < conf_thresh || text.is_empty() {
            continue;
        }
        let mid_y = raw
            .boxes
            .get(i)
            .map_or(0.0, |quad| (quad[0][1] + quad[2][1]) / 2.0);
        survivors.push((mid_y, text, score));
    }

    if survivors.is_empty() {
        return (String::new(), 0.0);
    }

    survivors.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let joined = survivors
        .iter()
        .map(|(_, text, _)| *text)
        .collect::<Vec<_>>()
        .join(" ");
    #[allow(clippy::cast_precision_loss)]
    let avg = survivors.iter().map(|(_, _, score)| score).sum::<f32>() / survivors.len() as f32;
    (joined, avg)
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EngineKey {
    pub lang: String,
    pub device: Device,
}

#[derive(Debug, Error)]
pub enum NewRecognizerError {
    #[error("{0}")]
    Init(String),
}

pub type RecognizerFactory =
    Box<dyn Fn(&EngineKey) -> Result<DynRecognizer, NewRecognizerError> + Send + Sync>;

/// Process-wide engine registry: one engine per `(language, device)` key,
/// created on first use under the cache lock.
pub struct EngineCache {
    factory: RecognizerFactory,
    engines: Mutex<HashMap<EngineKey, Arc<OcrEngine>>>,
}

impl EngineCache {
    #[must_use]
    pub fn new(factory: RecognizerFactory) -> Arc<Self> {
        Arc::new(Self {
            factory,
            engines: Mutex::new(HashMap::new()),
        })
    }

    /// Cache with no real inference backend.
    #[must_use]
    pub fn noop() -> Arc<Self> {
        Self::new(Box::new(|_| Ok(Box::new(NoopRecognizer {}))))
    }

    pub fn get(&self, key: &EngineKey) -> Result<Arc<OcrEngine>, NewRecognizerError> {
        let mut engines = self
            .engines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(engine) = engines.get(key) {
            return Ok(engine.clone());
        }
        let engine = OcrEngine::new((self.factory)(key)?);
        engines.insert(key.clone(), engine.clone());
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn quad(y_top: f32, y_bottom: f32) -> [[f32; 2]; 4] {
        [[0.0, y_top], [10.0, y_top], [10.0, y_bottom], [0.0, y_bottom]]
    }

    #[test]
    fn parse_empty() {
        assert_eq!((String::new(), 0.0), parse_recognition(None, 0.5));
        assert_eq!(
            (String::new(), 0.0),
            parse_recognition(Some(&Recognition::default()), 0.5)
        );
    }

    #[test]
    fn parse_filters_and_sorts() {
        let raw = Recognition {
            texts: vec![
                "bottom".to_owned(),
                "top".to_owned(),
                "low-conf".to_owned(),
                "  ".to_owned(),
            ],
            scores: vec![0.9, 0.8, 0.3, 0.9],
            boxes: vec![quad(20.0, 30.0), quad(0.0, 10.0), quad(5.0, 6.0), quad(1.0, 2.0)],
        };
        let (text, conf) = parse_recognition(Some(&raw), 0.5);
        assert_eq!("top bottom", text);
        assert!((conf - 0.85).abs() < 1e-6);
    }

    #[test]
    fn parse_missing_boxes_keeps_order() {
        let raw = Recognition {
            texts: vec!["a".to_owned(), "b".to_owned()],
            scores: vec![0.9, 0.9],
            boxes: Vec::new(),
        };
        let (text, _) = parse_recognition(Some(&raw), 0.5);
        assert_eq!("a b", text);
    }

    #[test]
    fn engine_cache_reuses_instances() {
        let cache = EngineCache::noop();
        let key = EngineKey {
            lang: "en".to_owned(),
            device: Device::Cpu,
        };
        let a = cache.get(&key).unwrap();
        let b = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = EngineKey {
            lang: "ch".to_owned(),
            device: Device::Cpu,
        };
        let c = cache.get(&other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn failed_frame_yields_none_slot() {
        struct Flaky(u32);
        impl TextRecognizer for Flaky {
            fn recognize(&mut self, _: &RgbImage) -> Result<Recognition, RecognizeError> {
                self.0 += 1;
                if self.0 % 2 == 0 {
                    Err(RecognizeError::Inference("boom".to_owned()))
                } else {
                    Ok(Recognition::default())
                }
            }
        }

        let engine = OcrEngine::new(Box::new(Flaky(0)));
        let frames = vec![RgbImage::new(2, 2); 4];
        let results = engine.predict_batch(&frames);
        assert_eq!(4, results.len());
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
        assert!(results[3].is_none());
    }
}

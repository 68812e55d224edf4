// SPDX-License-Identifier: GPL-2.0-or-later

mod engine;
mod worker;

pub use engine::{
    parse_recognition, Device, DynRecognizer, EngineCache, EngineKey, NewRecognizerError,
    NoopRecognizer, OcrEngine, Recognition, RecognizeError, RecognizerFactory, TextRecognizer,
};
pub use worker::{start_ocr_worker, OcrWorkerParams};

// SPDX-License-Identifier: GPL-2.0-or-later

pub mod config;
pub mod event;
pub mod subtitle;

pub use event::{ArcEventSink, DummyEventSink, Event, EventSink};

use serde::{Deserialize, Serialize};
use std::{ops::Deref, path::Path, str::FromStr, sync::Arc};
use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Video containers accepted by the upload endpoint.
pub const ALLOWED_VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "avi", "mov", "webm"];

/// Fallback frame rate when the container doesn't report one.
pub const DEFAULT_FPS: f64 = 25.0;

#[macro_export]
macro_rules! impl_deserialize_try_from_and_display {
    ($type:ident) => {
        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                String::deserialize(deserializer)?
                    .try_into()
                    .map_err(serde::de::Error::custom)
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

pub const CLIENT_ID_MAX_LENGTH: usize = 64;

/// Opaque client-chosen session identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct ClientId(String);
impl_deserialize_try_from_and_display!(ClientId);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseClientIdError {
    #[error("empty string")]
    Empty,

    #[error("invalid characters: '{0}'")]
    InvalidChars(String),

    #[error("too long")]
    TooLong,
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

impl TryFrom<String> for ClientId {
    type Error = ParseClientIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        use ParseClientIdError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        if !s.chars().all(is_id_char) {
            return Err(InvalidChars(s));
        }
        if s.len() > CLIENT_ID_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(s))
    }
}

impl FromStr for ClientId {
    type Err = ParseClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Chunked upload session identifier. Same alphabet as `ClientId`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct UploadId(String);
impl_deserialize_try_from_and_display!(UploadId);

impl TryFrom<String> for UploadId {
    type Error = ParseClientIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        use ParseClientIdError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        if !s.chars().all(is_id_char) {
            return Err(InvalidChars(s));
        }
        if s.len() > CLIENT_ID_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(s))
    }
}

impl FromStr for UploadId {
    type Err = ParseClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl Deref for UploadId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Rectangular band where captions are expected. A zero width means
/// "whole frame".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    #[must_use]
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    #[must_use]
    pub fn whole_frame(&self) -> bool {
        self.w == 0
    }

    /// Intersects the region with the frame bounds. Returns `None` when the
    /// intersection is empty.
    #[must_use]
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Roi> {
        if self.whole_frame() {
            return Some(Roi::new(0, 0, width, height));
        }
        let x = self.x.min(width);
        let y = self.y.min(height);
        let w = self.w.min(width.saturating_sub(x));
        let h = self.h.min(height.saturating_sub(y));
        if w == 0 || h == 0 {
            return None;
        }
        Some(Roi::new(x, y, w, h))
    }
}

/// Immutable description of an opened video file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u64,
    pub duration: f64,
}

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

pub const LOG_SOURCE_MAX_LENGTH: usize = 16;

#[repr(transparent)]
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LogSource(String);
impl_deserialize_try_from_and_display!(LogSource);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLogSourceError {
    #[error("empty string")]
    Empty,

    #[error("invalid characters: '{0}'")]
    InvalidChars(String),

    #[error("too long")]
    TooLong,
}

impl TryFrom<String> for LogSource {
    type Error = ParseLogSourceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        use ParseLogSourceError::*;
        if s.is_empty() {
            return Err(Empty);
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(InvalidChars(s));
        }
        if s.len() > LOG_SOURCE_MAX_LENGTH {
            return Err(TooLong);
        }
        Ok(Self(s))
    }
}

impl Deref for LogSource {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Log entry. The timestamp is applied by the logger.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: LogSource,
    pub client_id: Option<ClientId>,
    pub message: String,
}

impl LogEntry {
    #[allow(clippy::unwrap_used)]
    #[must_use]
    pub fn new(level: LogLevel, source: &'static str, message: String) -> Self {
        Self {
            level,
            source: source.to_owned().try_into().expect("source should be valid"),
            client_id: None,
            message,
        }
    }

    #[must_use]
    pub fn for_client(
        level: LogLevel,
        source: &'static str,
        client_id: ClientId,
        message: String,
    ) -> Self {
        let mut entry = Self::new(level, source, message);
        entry.client_id = Some(client_id);
        entry
    }
}

pub type ArcLogger = Arc<dyn ILogger + Send + Sync>;

pub trait ILogger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

/// Logger pre-bound to a source and optionally a client.
pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

pub struct DummyLogger;

impl DummyLogger {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(DummyLogger {})
    }
}

impl ILogger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

impl MsgLogger for DummyLogger {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

/// The operation was interrupted by a stop signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Object store credentials resolved from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

pub type DynEnvConfig = Box<dyn EnvConfig + Send + Sync>;

pub trait EnvConfig {
    fn port(&self) -> u16;
    fn cache_dir(&self) -> &Path;
    fn allowed_origins(&self) -> &[String];
    fn s3(&self) -> Option<&S3Config>;
}

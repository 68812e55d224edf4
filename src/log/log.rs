// SPDX-License-Identifier: GPL-2.0-or-later

use common::{
    ArcLogger, ArcMsgLogger, ClientId, ILogger, LogEntry, LogLevel, LogSource, MsgLogger,
};
use serde::Serialize;
use std::{
    fmt,
    ops::Deref,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::broadcast;

/// Logger used everywhere across the application.
pub struct Logger {
    /// Internal logging feed.
    feed: broadcast::Sender<LogEntryWithTime>,
}

impl Logger {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed }
    }

    /// Subscribes to the log feed and returns a channel that receives all
    /// log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl ILogger for Logger {
    /// Sends log entry to all subscribers. The timestamp is applied now.
    fn log(&self, log: LogEntry) {
        let log = LogEntryWithTime {
            level: log.level,
            source: log.source,
            client_id: log.client_id,
            message: log.message,
            time: UnixMicro::now(),
        };

        // Print to stdout.
        println!("{log}");

        // Only returns an error if there are no subscribers.
        self.feed.send(log).ok();
    }
}

/// Microseconds since the `UNIX_EPOCH`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct UnixMicro(pub u64);

impl UnixMicro {
    /// Current time as `UnixMicro`.
    fn now() -> Self {
        UnixMicro(
            u64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("broken system clock")
                    .as_micros(),
            )
            .expect("really broken system clock"),
        )
    }
}

impl Deref for UnixMicro {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Log entry with time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntryWithTime {
    /// Severity.
    pub level: LogLevel,

    /// Source.
    pub source: LogSource,

    /// Optional client ID if the message can be tied to a session.
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,

    /// Message.
    pub message: String,

    // Timestamp.
    pub time: UnixMicro,
}

impl fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            LogLevel::Error => write!(f, "[ERROR] ")?,
            LogLevel::Warning => write!(f, "[WARNING] ")?,
            LogLevel::Info => write!(f, "[INFO] ")?,
            LogLevel::Debug => write!(f, "[DEBUG] ")?,
        };

        if let Some(client_id) = &self.client_id {
            write!(f, "{client_id}: ")?;
        };

        write!(f, "{}: {}", self.source, self.message)
    }
}

/// `MsgLogger` bound to one source and one client.
pub struct SourceLogger {
    logger: ArcLogger,
    source: &'static str,
    client_id: Option<ClientId>,
}

impl SourceLogger {
    #[must_use]
    pub fn new(logger: ArcLogger, source: &'static str, client_id: Option<ClientId>) -> ArcMsgLogger {
        Arc::new(Self {
            logger,
            source,
            client_id,
        })
    }
}

impl MsgLogger for SourceLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        let mut entry = LogEntry::new(level, self.source, msg.to_owned());
        entry.client_id.clone_from(&self.client_id);
        self.logger.log(entry);
    }
}

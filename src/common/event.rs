// SPDX-License-Identifier: GPL-2.0-or-later

use crate::subtitle::SubtitleItem;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Engine event streamed to the owning client. The wire shape is a JSON
/// object tagged with `type`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Log {
        message: String,
    },
    SubtitleNew {
        item: SubtitleItem,
    },
    SubtitleUpdate {
        item: SubtitleItem,
    },
    Progress {
        current: u64,
        total: u64,
        eta: String,
    },
    Finish {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Event {
    #[must_use]
    pub fn finished() -> Self {
        Event::Finish {
            success: true,
            download_url: None,
            error: None,
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Event::Finish {
            success: false,
            download_url: None,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: String) -> Self {
        Event::Finish {
            success: false,
            download_url: None,
            error: Some(error),
        }
    }
}

pub type ArcEventSink = Arc<dyn EventSink + Send + Sync>;

/// Emitter handle a worker publishes through. Bound to a single client by
/// whoever constructs the worker; delivery failures are swallowed.
#[async_trait]
pub trait EventSink {
    async fn send(&self, event: Event);
}

pub struct DummyEventSink;

impl DummyEventSink {
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new() -> ArcEventSink {
        Arc::new(Self {})
    }
}

#[async_trait]
impl EventSink for DummyEventSink {
    async fn send(&self, _: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_json_shape() {
        let got = serde_json::to_string(&Event::Progress {
            current: 50,
            total: 100,
            eta: "00:10".to_owned(),
        })
        .unwrap();
        assert_eq!(
            r#"{"type":"progress","current":50,"total":100,"eta":"00:10"}"#,
            got
        );
    }

    #[test]
    fn finish_omits_empty_fields() {
        let got = serde_json::to_string(&Event::finished()).unwrap();
        assert_eq!(r#"{"type":"finish","success":true}"#, got);

        let got = serde_json::to_string(&Event::failed("boom".to_owned())).unwrap();
        assert_eq!(r#"{"type":"finish","success":false,"error":"boom"}"#, got);
    }
}

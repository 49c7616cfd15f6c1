//! Destinations for a session's single outcome

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;
use tracing::{error, info};
use tunneled_fetch_common::utils::with_marker;
use tunneled_fetch_common::{Result, TunnelError};

/// Receives the outcome of a session
///
/// The controller delivers at most once per session: either the outcome text
/// through [`ResultSink::deliver`], or the prepared content through
/// [`ResultSink::deliver_best_attempt`] when the deadline expires.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, outcome: &str);

    /// Deliver prepared content after the deadline; `false` if there is none
    fn deliver_best_attempt(&self) -> bool {
        false
    }
}

/// Title and body of a push notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub body: String,
}

impl NotificationContent {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }

    /// Parse a push payload
    ///
    /// Accepts a flat `{"title": .., "body": ..}` object or an APNs payload
    /// where `aps.alert` is either an object with title and body or a plain
    /// string used as the body.
    pub fn from_payload(raw: &[u8]) -> Result<Self> {
        let payload: Value = serde_json::from_slice(raw)?;

        let alert = payload.get("aps").and_then(|aps| aps.get("alert"));
        match alert {
            Some(Value::String(body)) => Ok(Self::new("", body.as_str())),
            Some(alert @ Value::Object(_)) => Ok(serde_json::from_value(alert.clone())?),
            Some(_) => Err(TunnelError::Config(
                "aps.alert must be a string or an object".to_string(),
            )),
            None if payload.is_object() => Ok(serde_json::from_value(payload.clone())?),
            None => Err(TunnelError::Config(
                "notification payload must be a JSON object".to_string(),
            )),
        }
    }
}

/// Writes a modified notification as one JSON line
///
/// The title is marked `[modified]` up front. A delivered outcome replaces the
/// body and is marked `[display notif]`; an expired session keeps the
/// original body and marks the title `[time expired]`.
pub struct NotificationSink<W: Write + Send> {
    content: NotificationContent,
    writer: Mutex<W>,
}

impl<W: Write + Send> NotificationSink<W> {
    pub fn new(original: NotificationContent, writer: W) -> Self {
        let content = NotificationContent {
            title: with_marker(&original.title, "modified"),
            body: original.body,
        };

        Self {
            content,
            writer: Mutex::new(writer),
        }
    }

    /// The prepared content, before any outcome is applied
    pub fn content(&self) -> &NotificationContent {
        &self.content
    }

    pub fn into_writer(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, content: &NotificationContent) {
        let Ok(mut writer) = self.writer.lock() else {
            error!("Notification writer lock poisoned");
            return;
        };

        let written = serde_json::to_writer(&mut *writer, content)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(writer))
            .and_then(|()| writer.flush());

        match written {
            Ok(()) => info!("Delivered notification: {}", content.title),
            Err(e) => error!("Failed to write notification: {}", e),
        }
    }
}

impl<W: Write + Send> ResultSink for NotificationSink<W> {
    fn deliver(&self, outcome: &str) {
        let content = NotificationContent {
            title: self.content.title.clone(),
            body: with_marker(outcome, "display notif"),
        };
        self.write(&content);
    }

    fn deliver_best_attempt(&self) -> bool {
        let content = NotificationContent {
            title: with_marker(&self.content.title, "time expired"),
            body: self.content.body.clone(),
        };
        self.write(&content);
        true
    }
}

/// Writes the outcome text as-is, like a status label
pub struct TextSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> ResultSink for TextSink<W> {
    fn deliver(&self, outcome: &str) {
        let Ok(mut writer) = self.writer.lock() else {
            error!("Output writer lock poisoned");
            return;
        };

        if let Err(e) = writeln!(writer, "{}", outcome).and_then(|()| writer.flush()) {
            error!("Failed to write outcome: {}", e);
        }
    }
}

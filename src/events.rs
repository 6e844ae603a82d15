use serde::Serialize;
use tokio::sync::mpsc;

use crate::service::ExportReport;

pub const PROGRESS_STARTED: f64 = 0.0;
pub const PROGRESS_METADATA: f64 = 20.0;
pub const PROGRESS_FIRST_SLICE: f64 = 80.0;
pub const PROGRESS_RENDERED: f64 = 91.0;
pub const PROGRESS_READY: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    pub percentage: f64,
    pub message: String,
}

/// Everything the session publishes to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionEvent {
    Progress(LoadProgress),
    /// The single channel for user-facing failures.
    Error { message: String },
    SliceLoaded { index: usize },
    SliceFailed { index: usize, message: String },
    BackgroundLoadFinished { generation: u64 },
    ExportFinished(ExportReport),
    ExportFailed { message: String },
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Sends an event, ignoring a dropped receiver.
pub(crate) fn publish(sender: &EventSender, event: SessionEvent) {
    if sender.send(event).is_err() {
        tracing::trace!("session event dropped, no listener");
    }
}

pub(crate) fn progress(sender: &EventSender, percentage: f64, message: impl Into<String>) {
    publish(
        sender,
        SessionEvent::Progress(LoadProgress {
            percentage: percentage.clamp(0.0, 100.0),
            message: message.into(),
        }),
    );
}

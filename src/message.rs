// Message sink - single funnel for every diagnostic the manager emits
//
// The rest of the renderer hands us a sink accepting (text, severity);
// the default sink routes into the `log` crate.

use serde::Deserialize;

/// Severity attached to every diagnostic message.
///
/// `Fatal` is reserved for mid-frame invariant violations that have no
/// recovery path inside this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Receiver for all diagnostics produced during bring-up and per-frame work.
///
/// Implementations must be callable from the Vulkan debug messenger, which
/// may fire on driver threads.
pub trait MessageSink: Send + Sync {
    fn message(&self, severity: MessageSeverity, text: &str);
}

/// Default sink: forwards everything to the `log` crate.
pub struct LogMessageSink;

impl MessageSink for LogMessageSink {
    fn message(&self, severity: MessageSeverity, text: &str) {
        match severity {
            MessageSeverity::Info => log::info!("{}", text),
            MessageSeverity::Warning => log::warn!("{}", text),
            MessageSeverity::Error | MessageSeverity::Fatal => log::error!("{}", text),
        }
    }
}

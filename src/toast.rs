use crate::config::{ConfigProvider, LogVerbosity, StatusVerbosity};
use chrono::{DateTime, Utc};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

const QUEUE_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl Severity {
    fn is_alert(self) -> bool {
        matches!(self, Severity::Warning | Severity::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Status,
    Log,
}

#[derive(Debug, Clone)]
pub struct Toast {
    pub channel: Channel,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget notification sink with two verbosity-gated channels:
/// `status` for the quota dashboard, `log` for technical events. Messages go
/// to tracing and a small bounded queue; nothing in the request path ever
/// waits on this.
pub struct Notifier {
    provider: Arc<ConfigProvider>,
    queue: Mutex<VecDeque<Toast>>,
}

impl Notifier {
    pub fn new(provider: Arc<ConfigProvider>) -> Self {
        Self {
            provider,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn emit_status(&self, severity: Severity, message: impl Into<String>, title: &str) {
        let verbosity = self.provider.current().gui.status;
        match verbosity {
            StatusVerbosity::None => return,
            StatusVerbosity::Alert if !severity.is_alert() => return,
            _ => {}
        }
        self.dispatch(Channel::Status, severity, message.into(), title);
    }

    pub fn emit_log(&self, severity: Severity, message: impl Into<String>, title: &str) {
        let verbosity = self.provider.current().gui.logs;
        match verbosity {
            LogVerbosity::None => return,
            LogVerbosity::Error if !severity.is_alert() => return,
            _ => {}
        }
        self.dispatch(Channel::Log, severity, message.into(), title);
    }

    fn dispatch(&self, channel: Channel, severity: Severity, message: String, title: &str) {
        match severity {
            Severity::Error => tracing::error!(title, "{message}"),
            Severity::Warning => tracing::warn!(title, "{message}"),
            Severity::Info | Severity::Success => tracing::info!(title, "{message}"),
        }

        let mut queue = self.queue.lock().expect("toast queue poisoned");
        queue.push_back(Toast {
            channel,
            severity,
            title: title.to_string(),
            message,
            timestamp: Utc::now(),
        });
        while queue.len() > QUEUE_CAP {
            queue.pop_front();
        }
    }

    pub fn recent(&self) -> Vec<Toast> {
        self.queue
            .lock()
            .expect("toast queue poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

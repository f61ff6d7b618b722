//! Watcher status: what the one-line status display shows.
//!
//! `StatusLine` folds connector lifecycle events and the cache's unread
//! count into a single renderable value. It is updated from the lifecycle
//! handlers and re-rendered only when something visible changed.

use taskflow_sync::connector::{DisconnectReason, LifecycleEvent};

/// Channel health as the user sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Online,
    Reconnecting { attempt: u32 },
    /// `gave_up` is set once every reconnect attempt failed.
    Offline { gave_up: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub link: LinkStatus,
    pub unread: usize,
    pub reconnects: u32,
    pub last_error: Option<String>,
}

impl Default for StatusLine {
    fn default() -> Self {
        Self {
            link: LinkStatus::Connecting,
            unread: 0,
            reconnects: 0,
            last_error: None,
        }
    }
}

impl StatusLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one lifecycle event in. Returns true if the rendering changed.
    pub fn apply(&mut self, event: &LifecycleEvent) -> bool {
        let before = self.clone();
        match event {
            LifecycleEvent::Connected => {
                self.link = LinkStatus::Online;
                self.last_error = None;
            }
            LifecycleEvent::Disconnected(DisconnectReason::ClientRequested) => {
                self.link = LinkStatus::Offline { gave_up: false };
            }
            LifecycleEvent::Disconnected(_) => {
                self.link = LinkStatus::Reconnecting { attempt: 0 };
            }
            LifecycleEvent::Error(error) => {
                self.last_error = Some(error.to_string());
            }
            LifecycleEvent::ReconnectAttempt(n) => {
                self.link = LinkStatus::Reconnecting { attempt: *n };
            }
            LifecycleEvent::ReconnectSuccess(_) => {
                self.reconnects += 1;
            }
            LifecycleEvent::ReconnectFailed { .. } => {
                self.link = LinkStatus::Offline { gave_up: true };
            }
        }
        *self != before
    }

    pub fn set_unread(&mut self, unread: usize) -> bool {
        std::mem::replace(&mut self.unread, unread) != unread
    }

    pub fn render(&self) -> String {
        let link = match self.link {
            LinkStatus::Connecting => "connecting".to_string(),
            LinkStatus::Online => "online".to_string(),
            LinkStatus::Reconnecting { attempt: 0 } => "link lost".to_string(),
            LinkStatus::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
            LinkStatus::Offline { gave_up: true } => "offline, press r to retry".to_string(),
            LinkStatus::Offline { gave_up: false } => "offline".to_string(),
        };
        let mut line = format!("[{link}] {} unread", self.unread);
        if let Some(error) = &self.last_error {
            line.push_str(&format!(" | last error: {error}"));
        }
        line
    }
}

//! Seams between the client core and the hosting application shell.
//!
//! The core never touches routing, toasts or view stores directly; the
//! shell hands in implementations of these traits at start-up.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }
}

pub trait Navigator: Send + Sync {
    /// Path (plus query) the user is currently looking at.
    fn current_location(&self) -> String;
    /// In-app route change.
    fn navigate(&self, path: &str);
    /// Full page navigation, used after login to land on a captured target.
    fn redirect(&self, target: &str);
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    Logout,
    Expired,
    Rejected,
}

impl SessionEndReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }
}

/// Dependent stores that load on sign-in and reset on sign-out.
pub trait SessionListener: Send + Sync {
    fn session_started(&self) {}
    fn session_ended(&self, _reason: SessionEndReason) {}
}

/// Shell used when the host has no routing (CLI tools, tests).
#[derive(Debug, Default)]
pub struct HeadlessShell {
    location: Mutex<String>,
    navigations: Mutex<Vec<String>>,
    redirects: Mutex<Vec<String>>,
    notices: Mutex<Vec<Notice>>,
}

impl HeadlessShell {
    pub fn at(location: impl Into<String>) -> Self {
        Self {
            location: Mutex::new(location.into()),
            ..Self::default()
        }
    }

    pub fn set_location(&self, location: impl Into<String>) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = location.into();
    }

    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn redirects(&self) -> Vec<String> {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Navigator for HeadlessShell {
    fn current_location(&self) -> String {
        let location = self
            .location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if location.trim().is_empty() {
            "/".to_string()
        } else {
            location
        }
    }

    fn navigate(&self, path: &str) {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_string());
        self.set_location(path);
    }

    fn redirect(&self, target: &str) {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.to_string());
        self.set_location(target);
    }
}

impl Notifier for HeadlessShell {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice);
    }
}

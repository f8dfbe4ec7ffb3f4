//! Push notifications for security-relevant state changes.
//!
//! Same contract as email: sent after commit, best effort, failures logged.
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    AccountLocked,
    ProfileRegistered,
    ProfileUpdated,
    ProfileDeleted,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccountLocked => "account_locked",
            Self::ProfileRegistered => "profile_registered",
            Self::ProfileUpdated => "profile_updated",
            Self::ProfileDeleted => "profile_deleted",
        }
    }

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::AccountLocked => "Face verification locked",
            Self::ProfileRegistered => "Face ID registered",
            Self::ProfileUpdated => "Face ID updated",
            Self::ProfileDeleted => "Face ID removed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Notification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
}

impl Notification {
    #[must_use]
    pub fn new(user_id: Uuid, kind: NotificationKind) -> Self {
        Self { user_id, kind }
    }
}

pub trait PushNotifier: Send + Sync {
    /// Deliver a notification or return an error.
    fn send(&self, notification: &Notification) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogPushNotifier;

impl PushNotifier for LogPushNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            user_id = %notification.user_id,
            kind = notification.kind.as_str(),
            title = notification.kind.title(),
            "push notification stub"
        );
        Ok(())
    }
}

/// Fire-and-forget delivery on the blocking pool.
pub fn dispatch(notifier: Arc<dyn PushNotifier>, notification: Notification) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = notifier.send(&notification) {
            warn!(
                user_id = %notification.user_id,
                kind = notification.kind.as_str(),
                "Failed to send push notification: {err:#}"
            );
        }
    });
}

//! Notification center
//!
//! Keeps the notifications, errors and load failures reported by the host
//! and its extensions so a front end can display them, and queues dialogs
//! until someone answers them with [`NotificationCenter::resolve_dialog`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modhost_extension_api::{Dialog, DialogResult, ErrorNotification, Notification, Notifier};
use modhost_runtime::LoadFailures;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Prefix of generated notification ids.
pub const AUTO_ID_PREFIX: &str = "__auto_";

/// A notification as stored by the center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNotification {
    pub notification: Notification,
    pub created_at: DateTime<Utc>,
}

struct PendingDialog {
    dialog: Dialog,
    reply: oneshot::Sender<DialogResult>,
}

/// Notifier that keeps everything it is told.
#[derive(Default)]
pub struct NotificationCenter {
    next_id: AtomicU64,
    notifications: Mutex<Vec<StoredNotification>>,
    errors: Mutex<Vec<ErrorNotification>>,
    load_failures: Mutex<LoadFailures>,
    dialogs: Mutex<BTreeMap<String, PendingDialog>>,
    dialog_posted: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently shown, oldest first.
    pub fn notifications(&self) -> Vec<StoredNotification> {
        lock(&self.notifications).clone()
    }

    /// Errors reported so far.
    pub fn errors(&self) -> Vec<ErrorNotification> {
        lock(&self.errors).clone()
    }

    /// The most recent load-failure report.
    pub fn load_failures(&self) -> LoadFailures {
        lock(&self.load_failures).clone()
    }

    /// Dialogs waiting for an answer, by id.
    pub fn pending_dialogs(&self) -> Vec<(String, Dialog)> {
        lock(&self.dialogs)
            .iter()
            .map(|(id, pending)| (id.clone(), pending.dialog.clone()))
            .collect()
    }

    /// Wait until a dialog is pending and return the oldest one.
    pub async fn next_dialog(&self) -> (String, Dialog) {
        loop {
            let posted = self.dialog_posted.notified();
            tokio::pin!(posted);
            posted.as_mut().enable();

            if let Some(first) = self.pending_dialogs().into_iter().next() {
                return first;
            }
            posted.await;
        }
    }

    /// Answer dialog `id` with `action`.
    ///
    /// Returns false if no such dialog is pending.
    pub fn resolve_dialog(&self, id: &str, action: impl Into<String>) -> bool {
        let Some(pending) = lock(&self.dialogs).remove(id) else {
            return false;
        };

        let action = action.into();
        debug!(dialog = id, action = %action, "Dialog answered");
        if pending.reply.send(DialogResult { action }).is_err() {
            debug!(dialog = id, "Dialog was abandoned before it was answered");
        }
        true
    }

    /// Close dialog `id` without an answer. The asker gets an error.
    pub fn dismiss_dialog(&self, id: &str) -> bool {
        lock(&self.dialogs).remove(id).is_some()
    }

    fn generate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{AUTO_ID_PREFIX}{n}")
    }
}

/// Removes an abandoned dialog from the queue.
struct DialogGuard<'a> {
    center: &'a NotificationCenter,
    id: String,
}

impl Drop for DialogGuard<'_> {
    fn drop(&mut self) {
        lock(&self.center.dialogs).remove(&self.id);
    }
}

#[async_trait]
impl Notifier for NotificationCenter {
    fn send_notification(&self, mut notification: Notification) -> String {
        let id = match &notification.id {
            Some(id) => id.clone(),
            None => self.generate_id(),
        };
        notification.id = Some(id.clone());

        info!(id = %id, kind = ?notification.kind, "{}", notification.message);

        let mut notifications = lock(&self.notifications);
        notifications.retain(|existing| existing.notification.id.as_deref() != Some(id.as_str()));
        notifications.push(StoredNotification {
            notification,
            created_at: Utc::now(),
        });
        id
    }

    fn dismiss_notification(&self, id: &str) {
        let mut notifications = lock(&self.notifications);
        let before = notifications.len();
        notifications.retain(|existing| existing.notification.id.as_deref() != Some(id));
        if notifications.len() == before {
            debug!(id, "Dismissed unknown notification");
        }
    }

    fn show_error(&self, notification: ErrorNotification) {
        error!(
            extension = notification.extension.as_deref().unwrap_or("-"),
            "{}: {} ({})",
            notification.title,
            notification.message,
            notification.error_message
        );
        lock(&self.errors).push(notification);
    }

    fn report_load_failures(&self, failures: &LoadFailures) {
        for (extension, failures) in failures {
            warn!(extension = %extension, ?failures, "Extension not loaded");
        }
        *lock(&self.load_failures) = failures.clone();
    }

    async fn show_dialog(&self, dialog: Dialog) -> anyhow::Result<DialogResult> {
        let id = uuid::Uuid::new_v4().to_string();
        let (reply, answer) = oneshot::channel();

        info!(dialog = %id, title = %dialog.title, actions = ?dialog.actions, "Waiting for an answer");
        lock(&self.dialogs).insert(id.clone(), PendingDialog { dialog, reply });
        let _guard = DialogGuard { center: self, id };
        self.dialog_posted.notify_waiters();

        answer
            .await
            .map_err(|_| anyhow::anyhow!("Dialog was dismissed without an answer"))
    }
}

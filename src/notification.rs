//! Notification dispatcher
//!
//! Notifications are written after the settlement that caused them has
//! committed. A failed write is reported back to the caller but never undoes
//! the settlement.
use crate::error::EngineError;
use crate::store::{self, AbortExt};
use crate::types::{SwapId, TimeStamp, UserId};
use chrono::Utc;
use sled::{Db, Tree};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum NotificationKind {
    #[n(0)]
    SwapRequest,
    #[n(1)]
    SwapCountered,
    #[n(2)]
    SwapAccepted,
    #[n(3)]
    SwapDeclined,
    #[n(4)]
    SwapCancelled,
    #[n(5)]
    ChatMessage,
    #[n(6)]
    ItemRedeemed,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    /// Monotonic sequence number, unique across the store.
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub recipient: UserId,
    #[n(2)]
    pub kind: NotificationKind,
    #[n(3)]
    pub swap_id: Option<SwapId>,
    #[n(4)]
    pub message: String,
    #[n(5)]
    pub is_read: bool,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

/// What a committed transition wants to tell someone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub swap_id: Option<SwapId>,
    pub message: String,
}

impl NotificationEvent {
    pub fn new(
        recipient: UserId,
        kind: NotificationKind,
        swap_id: Option<SwapId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            kind,
            swap_id,
            message: message.into(),
        }
    }
}

/// Where a page of notifications starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cursor {
    /// The most recent notifications, newest first.
    #[default]
    Latest,
    /// Notifications older than this id, newest first.
    Before(u64),
    /// Notifications newer than this id, oldest first.
    After(u64),
}

impl From<Option<u64>> for Cursor {
    fn from(before: Option<u64>) -> Self {
        before.map_or(Cursor::Latest, Cursor::Before)
    }
}

/// Persistence for notifications.
pub trait NotificationStore: Send + Sync {
    fn append(&self, event: &NotificationEvent) -> Result<Notification, EngineError>;
    fn list(
        &self,
        recipient: &UserId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<Vec<Notification>, EngineError>;
    fn mark_read(&self, recipient: &UserId, id: u64) -> Result<Notification, EngineError>;
}

pub struct SledNotificationStore {
    db: Db,
    tree: Tree,
}

impl SledNotificationStore {
    pub fn new(db: Db, tree: Tree) -> Self {
        Self { db, tree }
    }
}

// `recipient/00000000000000000042` sorts by sequence within a recipient.
fn key(recipient: &UserId, id: u64) -> Vec<u8> {
    format!("{recipient}/{id:020}").into_bytes()
}

impl NotificationStore for SledNotificationStore {
    fn append(&self, event: &NotificationEvent) -> Result<Notification, EngineError> {
        let notification = Notification {
            id: self.db.generate_id()?,
            recipient: event.recipient.clone(),
            kind: event.kind,
            swap_id: event.swap_id.clone(),
            message: event.message.clone(),
            is_read: false,
            created_at: TimeStamp::new(),
        };
        store::put(
            &self.tree,
            &key(&notification.recipient, notification.id),
            &notification,
        )?;
        Ok(notification)
    }

    fn list(
        &self,
        recipient: &UserId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<Vec<Notification>, EngineError> {
        let first = format!("{recipient}/").into_bytes();
        // '0' is the byte after '/', so this bound closes the recipient's prefix
        let end = format!("{recipient}0").into_bytes();

        let entries: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            match cursor {
                Cursor::Latest => Box::new(self.tree.range(first..end).rev()),
                Cursor::Before(id) => Box::new(self.tree.range(first..key(recipient, id)).rev()),
                Cursor::After(id) => {
                    Box::new(self.tree.range(key(recipient, id.saturating_add(1))..end))
                }
            };

        let mut out = Vec::new();
        for entry in entries.take(limit) {
            let (_, bytes) = entry?;
            out.push(store::decode(&bytes)?);
        }
        Ok(out)
    }

    fn mark_read(&self, recipient: &UserId, id: u64) -> Result<Notification, EngineError> {
        let key = key(recipient, id);
        let notification = self.tree.transaction(|tree| {
            let mut notification: Notification = store::tx_get(tree, &key)?
                .ok_or_else(|| EngineError::not_found("notification", id))
                .or_abort()?;
            notification.is_read = true;
            store::tx_put(tree, &key, &notification)?;
            Ok(notification)
        })?;
        Ok(notification)
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    pub fn notify(
        &self,
        recipient: &UserId,
        kind: NotificationKind,
        swap_id: Option<&SwapId>,
        message: impl Into<String>,
    ) -> Result<Notification, EngineError> {
        let event = NotificationEvent::new(recipient.clone(), kind, swap_id.cloned(), message);
        self.persist(&event)
    }

    fn persist(&self, event: &NotificationEvent) -> Result<Notification, EngineError> {
        let notification = self
            .store
            .append(event)
            .map_err(|e| EngineError::NotificationPersistFailure(e.to_string()))?;
        debug!(
            recipient = %notification.recipient,
            kind = ?notification.kind,
            id = notification.id,
            "Notification stored"
        );
        Ok(notification)
    }

    /// Persist every event in order, returning the failures. Failures are
    /// logged here; the settlement that produced the events stays committed.
    pub fn dispatch(&self, events: Vec<NotificationEvent>) -> Vec<EngineError> {
        let mut failures = Vec::new();
        for event in events {
            if let Err(e) = self.persist(&event) {
                error!(
                    recipient = %event.recipient,
                    kind = ?event.kind,
                    error = %e,
                    "Notification could not be stored"
                );
                failures.push(e);
            }
        }
        failures
    }

    pub fn list(
        &self,
        recipient: &UserId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<Vec<Notification>, EngineError> {
        self.store.list(recipient, cursor, limit)
    }

    pub fn mark_read(&self, recipient: &UserId, id: u64) -> Result<Notification, EngineError> {
        self.store.mark_read(recipient, id)
    }
}

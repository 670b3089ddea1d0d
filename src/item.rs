//! Item availability store
//!
//! An item carries a single lifecycle status. Whether it is approved or can be
//! acted on is derived from that status, never tracked as a separate flag.
use crate::error::EngineError;
use crate::store::{self, AbortExt, TxResult};
use crate::types::{ItemId, TimeStamp, UserId};
use chrono::Utc;
use sled::Tree;
use sled::transaction::TransactionalTree;
use std::fmt;
use tracing::{debug, info};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    #[n(0)]
    PendingApproval,
    #[n(1)]
    Available,
    #[n(2)]
    Reserved,
    #[n(3)]
    Removed,
    #[n(4)]
    Rejected,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::PendingApproval => "pending approval",
            ItemStatus::Available => "available",
            ItemStatus::Reserved => "reserved",
            ItemStatus::Removed => "removed",
            ItemStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    #[n(0)]
    pub id: ItemId,
    #[n(1)]
    pub owner: UserId,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub points_value: u64,
    #[n(4)]
    pub status: ItemStatus,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

impl Item {
    pub fn new(owner: UserId, title: impl Into<String>, points_value: u64) -> Self {
        let now = TimeStamp::new();
        Self {
            id: ItemId::generate(),
            owner,
            title: title.into(),
            points_value,
            status: ItemStatus::PendingApproval,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Moderation has let the item through, whether or not it is committed yet.
    pub fn is_approved(&self) -> bool {
        matches!(self.status, ItemStatus::Available | ItemStatus::Reserved)
    }

    pub fn is_available(&self) -> bool {
        self.status == ItemStatus::Available
    }

    fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
        self.updated_at = TimeStamp::new();
    }
}

pub struct ItemStore {
    items: Tree,
}

impl ItemStore {
    pub fn new(items: Tree) -> Self {
        Self { items }
    }

    pub fn insert(&self, item: &Item) -> Result<(), EngineError> {
        if item.points_value == 0 {
            return Err(EngineError::InvalidAmount);
        }
        store::put(&self.items, item.id.as_bytes(), item)?;
        info!(item = %item.id, owner = %item.owner, "Listed item for review");
        Ok(())
    }

    pub fn get(&self, id: &ItemId) -> Result<Item, EngineError> {
        store::get(&self.items, id.as_bytes())?.ok_or_else(|| EngineError::not_found("item", id))
    }

    pub fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Item>, EngineError> {
        let mut items: Vec<Item> = store::scan_all(&self.items)?;
        items.retain(|item| &item.owner == owner);
        Ok(items)
    }

    /// Available -> Reserved. Fails with `ItemNotAvailable` from any other status.
    pub fn reserve(&self, id: &ItemId) -> Result<Item, EngineError> {
        Ok(self.items.transaction(|items| reserve_in(items, id))?)
    }

    /// Reserved -> Available.
    pub fn release(&self, id: &ItemId) -> Result<Item, EngineError> {
        let item = self.items.transaction(|items| {
            let mut item = load_in(items, id)?;
            if item.status != ItemStatus::Reserved {
                return Err(EngineError::ItemNotAvailable(id.to_string()).into());
            }
            item.set_status(ItemStatus::Available);
            store::tx_put(items, id.as_bytes(), &item)?;
            Ok(item)
        })?;
        info!(item = %id, "Released reservation");
        Ok(item)
    }

    /// Moderation approval: PendingApproval -> Available.
    pub fn approve(&self, id: &ItemId) -> Result<Item, EngineError> {
        self.moderate(id, ItemStatus::Available)
    }

    /// Moderation rejection: PendingApproval -> Rejected (terminal).
    pub fn reject(&self, id: &ItemId) -> Result<Item, EngineError> {
        self.moderate(id, ItemStatus::Rejected)
    }

    /// Any status -> Removed (terminal).
    pub fn remove(&self, id: &ItemId) -> Result<Item, EngineError> {
        let item = self.items.transaction(|items| {
            let mut item = load_in(items, id)?;
            item.set_status(ItemStatus::Removed);
            store::tx_put(items, id.as_bytes(), &item)?;
            Ok(item)
        })?;
        info!(item = %id, "Removed item");
        Ok(item)
    }

    fn moderate(&self, id: &ItemId, to: ItemStatus) -> Result<Item, EngineError> {
        let item = self.items.transaction(|items| {
            let mut item = load_in(items, id)?;
            if item.status != ItemStatus::PendingApproval {
                return Err(EngineError::ItemNotAvailable(id.to_string()).into());
            }
            item.set_status(to);
            store::tx_put(items, id.as_bytes(), &item)?;
            Ok(item)
        })?;
        info!(item = %id, status = %to, "Moderated item");
        Ok(item)
    }
}

pub(crate) fn load_in(items: &TransactionalTree, id: &ItemId) -> TxResult<Item> {
    store::tx_get(items, id.as_bytes())?
        .ok_or_else(|| EngineError::not_found("item", id))
        .or_abort()
}

/// Transaction-scoped reservation. The status check and the write happen in
/// the same transaction, so two settlements can never both reserve one item.
pub(crate) fn reserve_in(items: &TransactionalTree, id: &ItemId) -> TxResult<Item> {
    let mut item = load_in(items, id)?;
    if !item.is_available() {
        debug!(item = %id, status = %item.status, "Reservation refused");
        return Err(EngineError::ItemNotAvailable(id.to_string()).into());
    }
    item.set_status(ItemStatus::Reserved);
    store::tx_put(items, id.as_bytes(), &item)?;
    Ok(item)
}

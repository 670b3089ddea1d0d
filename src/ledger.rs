//! Points ledger: the only writer of user balances
use crate::error::EngineError;
use crate::store::{self, AbortExt, TxResult};
use crate::types::{TimeStamp, UserId};
use chrono::Utc;
use sled::Tree;
use sled::transaction::TransactionalTree;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub points: u64,
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, points: u64) -> Self {
        Self {
            id: UserId::generate(),
            name: name.into(),
            points,
            created_at: TimeStamp::new(),
        }
    }
}

pub struct PointsLedger {
    users: Tree,
}

impl PointsLedger {
    pub fn new(users: Tree) -> Self {
        Self { users }
    }

    pub fn open_account(&self, user: &User) -> Result<(), EngineError> {
        store::put(&self.users, user.id.as_bytes(), user)
    }

    pub fn user(&self, id: &UserId) -> Result<User, EngineError> {
        store::get(&self.users, id.as_bytes())?.ok_or_else(|| EngineError::not_found("user", id))
    }

    pub fn balance(&self, id: &UserId) -> Result<u64, EngineError> {
        Ok(self.user(id)?.points)
    }

    /// Returns the new balance.
    pub fn debit(&self, id: &UserId, amount: u64) -> Result<u64, EngineError> {
        let balance = self.users.transaction(|users| debit_in(users, id, amount))?;
        debug!(user = %id, amount, balance, "Debited points");
        Ok(balance)
    }

    /// Returns the new balance.
    pub fn credit(&self, id: &UserId, amount: u64) -> Result<u64, EngineError> {
        let balance = self.users.transaction(|users| credit_in(users, id, amount))?;
        debug!(user = %id, amount, balance, "Credited points");
        Ok(balance)
    }
}

fn load_in(users: &TransactionalTree, id: &UserId) -> TxResult<User> {
    store::tx_get(users, id.as_bytes())?
        .ok_or_else(|| EngineError::not_found("user", id))
        .or_abort()
}

/// Transaction-scoped debit, for composing into a larger settlement.
pub(crate) fn debit_in(users: &TransactionalTree, id: &UserId, amount: u64) -> TxResult<u64> {
    if amount == 0 {
        return Err(EngineError::InvalidAmount.into());
    }
    let mut user = load_in(users, id)?;
    if user.points < amount {
        return Err(EngineError::InsufficientFunds {
            balance: user.points,
            required: amount,
        }
        .into());
    }
    user.points -= amount;
    store::tx_put(users, id.as_bytes(), &user)?;
    Ok(user.points)
}

pub(crate) fn credit_in(users: &TransactionalTree, id: &UserId, amount: u64) -> TxResult<u64> {
    if amount == 0 {
        return Err(EngineError::InvalidAmount.into());
    }
    let mut user = load_in(users, id)?;
    user.points = user
        .points
        .checked_add(amount)
        .ok_or(EngineError::InvalidAmount)
        .or_abort()?;
    store::tx_put(users, id.as_bytes(), &user)?;
    Ok(user.points)
}

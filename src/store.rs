//! sled trees and CBOR record helpers shared by every component
use crate::error::EngineError;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Db, Tree};

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, EngineError>;

const USERS: &str = "users";
const ITEMS: &str = "items";
const SWAPS: &str = "swaps";
const OPEN_SWAPS: &str = "open_swaps";
const RECEIPTS: &str = "receipts";
const NOTIFICATIONS: &str = "notifications";

/// Every tree lives in one `Db`, so any combination of them can join a
/// single sled transaction.
#[derive(Clone)]
pub struct Trees {
    pub users: Tree,
    pub items: Tree,
    pub swaps: Tree,
    /// `requester/responder_item` -> swap id, present only while a proposal is Pending.
    pub open_swaps: Tree,
    pub receipts: Tree,
    pub notifications: Tree,
}

impl Trees {
    pub fn open(db: &Db) -> Result<Self, EngineError> {
        Ok(Self {
            users: db.open_tree(USERS)?,
            items: db.open_tree(ITEMS)?,
            swaps: db.open_tree(SWAPS)?,
            open_swaps: db.open_tree(OPEN_SWAPS)?,
            receipts: db.open_tree(RECEIPTS)?,
            notifications: db.open_tree(NOTIFICATIONS)?,
        })
    }
}

pub(crate) trait AbortExt<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T> AbortExt<T> for Result<T, EngineError> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(ConflictableTransactionError::Abort)
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, EngineError> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, EngineError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

/// Read a record outside of a transaction.
pub(crate) fn get<T>(tree: &Tree, key: &[u8]) -> Result<Option<T>, EngineError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn put<T: minicbor::Encode<()>>(
    tree: &Tree,
    key: &[u8],
    value: &T,
) -> Result<(), EngineError> {
    tree.insert(key, encode(value)?)?;
    Ok(())
}

pub(crate) fn tx_get<T>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes).or_abort()?)),
        None => Ok(None),
    }
}

pub(crate) fn tx_put<T: minicbor::Encode<()>>(
    tree: &TransactionalTree,
    key: &[u8],
    value: &T,
) -> TxResult<()> {
    let bytes = encode(value).or_abort()?;
    tree.insert(key, bytes)?;
    Ok(())
}

/// Decode every record in a tree. Read paths only.
pub(crate) fn scan_all<T>(tree: &Tree) -> Result<Vec<T>, EngineError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (_, bytes) = entry?;
        out.push(decode(&bytes)?);
    }
    Ok(out)
}

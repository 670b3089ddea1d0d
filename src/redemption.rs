//! Redeeming an item directly against the buyer's points balance
use crate::error::EngineError;
use crate::item::{self, Item};
use crate::ledger;
use crate::store::{self, AbortExt, TxResult};
use crate::types::{ItemId, TimeStamp, UserId};
use chrono::Utc;
use sled::{Transactional, Tree};
use sled::transaction::TransactionalTree;
use tracing::{info, instrument};

// Key is the hash of the receipt body encoded into CBOR
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ReceiptBody {
    #[n(0)]
    pub item_id: ItemId,
    #[n(1)]
    pub buyer: UserId,
    #[n(2)]
    pub seller: UserId,
    #[n(3)]
    pub points: u64,
    #[n(4)]
    pub buyer_balance: u64,
    #[n(5)]
    pub redeemed_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Receipt {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub body: ReceiptBody,
}

impl ReceiptBody {
    /// The receipt id is the sha256 of the CBOR encoded body.
    pub fn finalise(self) -> Result<Receipt, EngineError> {
        let contents = store::encode(&self)?;
        let id = sha256::digest(&contents);
        Ok(Receipt { id, body: self })
    }
}

/// Redemption runs over the users, items and receipts trees in one sled
/// transaction: debit, reservation and receipt commit together or not at all.
pub struct Redemption {
    users: Tree,
    items: Tree,
    receipts: Tree,
}

impl Redemption {
    pub fn new(users: Tree, items: Tree, receipts: Tree) -> Self {
        Self {
            users,
            items,
            receipts,
        }
    }

    /// Returns the receipt and the item as it now stands.
    #[instrument(skip_all, fields(buyer = %buyer, item = %item_id))]
    pub fn redeem(&self, item_id: &ItemId, buyer: &UserId) -> Result<(Receipt, Item), EngineError> {
        let (receipt, item) = (&self.users, &self.items, &self.receipts).transaction(
            |(users, items, receipts)| redeem_in(users, items, receipts, item_id, buyer),
        )?;

        info!(
            receipt = %receipt.id,
            points = receipt.body.points,
            balance = receipt.body.buyer_balance,
            "Item redeemed"
        );
        Ok((receipt, item))
    }

    pub fn receipt(&self, id: &str) -> Result<Receipt, EngineError> {
        store::get(&self.receipts, id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("receipt", id))
    }
}

fn redeem_in(
    users: &TransactionalTree,
    items: &TransactionalTree,
    receipts: &TransactionalTree,
    item_id: &ItemId,
    buyer: &UserId,
) -> TxResult<(Receipt, Item)> {
    let current = item::load_in(items, item_id)?;
    if !current.is_available() {
        return Err(EngineError::ItemNotAvailable(item_id.to_string()).into());
    }
    if &current.owner == buyer {
        return Err(EngineError::SelfRedemption.into());
    }

    let buyer_balance = ledger::debit_in(users, buyer, current.points_value)?;
    let reserved = item::reserve_in(items, item_id)?;

    let receipt = ReceiptBody {
        item_id: item_id.clone(),
        buyer: buyer.clone(),
        seller: current.owner.clone(),
        points: current.points_value,
        buyer_balance,
        redeemed_at: TimeStamp::new(),
    }
    .finalise()
    .or_abort()?;

    store::tx_put(receipts, receipt.id.as_bytes(), &receipt)?;
    Ok((receipt, reserved))
}

//! Service layer API for swap, redemption and notification operations
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::identity::{Identity, TokenTable};
use crate::item::{self, Item, ItemStore};
use crate::ledger::{PointsLedger, User};
use crate::notification::{
    Cursor, Notification, NotificationDispatcher, NotificationEvent, NotificationKind,
    NotificationStore, SledNotificationStore,
};
use crate::redemption::{Receipt, Redemption};
use crate::store::{self, AbortExt, Trees, TxResult};
use crate::swap::{ChatMessage, DeliveryMethod, Party, SwapAction, SwapProposal, SwapStatus};
use crate::types::{ItemId, SwapId, TimeStamp, UserId};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A committed change plus any notifications that could not be stored.
/// The change stands regardless of `undelivered`.
#[derive(Debug)]
pub struct Committed<T> {
    pub record: T,
    pub undelivered: Vec<EngineError>,
}

impl<T> Committed<T> {
    pub fn into_record(self) -> T {
        self.record
    }
    pub fn fully_delivered(&self) -> bool {
        self.undelivered.is_empty()
    }
}

/// What the responder may do with a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapResponse {
    Accept,
    Decline,
    Counter(ItemId),
}

impl From<SwapResponse> for SwapAction {
    fn from(value: SwapResponse) -> Self {
        match value {
            SwapResponse::Accept => SwapAction::Accept,
            SwapResponse::Decline => SwapAction::Decline,
            SwapResponse::Counter(item) => SwapAction::Counter(item),
        }
    }
}

/// Entry point for every marketplace operation.
///
/// Operations take the acting user as an already resolved `UserId`. Request
/// handlers resolve it with [`ExchangeService::authenticate`] before calling a
/// mutating operation; ownership and role checks then run against that id.
pub struct ExchangeService {
    instance: Arc<sled::Db>,
    trees: Trees,
    ledger: PointsLedger,
    items: ItemStore,
    redemption: Redemption,
    notifications: NotificationDispatcher,
    identity: Arc<dyn Identity>,
    config: EngineConfig,
}

impl ExchangeService {
    pub fn new(instance: Arc<sled::Db>, config: EngineConfig) -> Result<Self, EngineError> {
        let trees = Trees::open(&instance)?;
        let notifications = SledNotificationStore::new(
            instance.as_ref().clone(),
            trees.notifications.clone(),
        );

        Ok(Self {
            ledger: PointsLedger::new(trees.users.clone()),
            items: ItemStore::new(trees.items.clone()),
            redemption: Redemption::new(
                trees.users.clone(),
                trees.items.clone(),
                trees.receipts.clone(),
            ),
            notifications: NotificationDispatcher::new(Arc::new(notifications)),
            identity: Arc::new(TokenTable::new()),
            trees,
            instance,
            config,
        })
    }

    /// Open the database described by `config`.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let db = config.open_db()?;
        Self::new(Arc::new(db), config)
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_notification_store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.notifications = NotificationDispatcher::new(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush dirty pages to disk.
    pub fn flush(&self) -> Result<usize, EngineError> {
        Ok(self.instance.flush()?)
    }

    /// Resolve the acting user for a request.
    pub fn authenticate(&self, session_token: Option<&str>) -> Result<UserId, EngineError> {
        session_token
            .and_then(|token| self.identity.current_user(token))
            .ok_or(EngineError::NotAuthenticated)
    }

    // Users and points

    pub fn register_user(&self, name: &str) -> Result<User, EngineError> {
        let user = User::new(name, self.config.starting_points);
        self.ledger.open_account(&user)?;
        info!(user = %user.id, points = user.points, "Registered user");
        Ok(user)
    }

    pub fn user(&self, id: &UserId) -> Result<User, EngineError> {
        self.ledger.user(id)
    }

    pub fn balance(&self, id: &UserId) -> Result<u64, EngineError> {
        self.ledger.balance(id)
    }

    pub fn grant_points(&self, id: &UserId, amount: u64) -> Result<u64, EngineError> {
        self.ledger.credit(id, amount)
    }

    // Items and moderation

    pub fn list_item(
        &self,
        owner: &UserId,
        title: &str,
        points_value: Option<u64>,
    ) -> Result<Item, EngineError> {
        self.ledger.user(owner)?;
        let value = points_value.unwrap_or(self.config.default_item_points);
        let item = Item::new(owner.clone(), title, value);
        self.items.insert(&item)?;
        Ok(item)
    }

    pub fn item(&self, id: &ItemId) -> Result<Item, EngineError> {
        self.items.get(id)
    }

    pub fn items_of(&self, owner: &UserId) -> Result<Vec<Item>, EngineError> {
        self.items.list_by_owner(owner)
    }

    pub fn approve_item(&self, id: &ItemId) -> Result<Item, EngineError> {
        self.items.approve(id)
    }

    pub fn reject_item(&self, id: &ItemId) -> Result<Item, EngineError> {
        self.items.reject(id)
    }

    pub fn remove_item(&self, id: &ItemId) -> Result<Item, EngineError> {
        self.items.remove(id)
    }

    /// Return a Reserved item to Available. Refused while an accepted swap or
    /// a redemption receipt holds the item.
    pub fn release_item(&self, id: &ItemId) -> Result<Item, EngineError> {
        // A Reserved item cannot gain a new holder, so the scan cannot go stale
        // before the release commits.
        if self.is_held_by_settlement(id)? {
            warn!(item = %id, "Release refused, item is held by a settlement");
            return Err(EngineError::ConflictingReservation);
        }
        self.items.release(id)
    }

    fn is_held_by_settlement(&self, id: &ItemId) -> Result<bool, EngineError> {
        let swaps: Vec<SwapProposal> = store::scan_all(&self.trees.swaps)?;
        let in_swap = swaps.iter().any(|swap| {
            swap.status == SwapStatus::Accepted
                && (&swap.requester_item == id || &swap.responder_item == id)
        });
        if in_swap {
            return Ok(true);
        }

        let receipts: Vec<Receipt> = store::scan_all(&self.trees.receipts)?;
        Ok(receipts.iter().any(|receipt| &receipt.body.item_id == id))
    }

    // Swaps

    /// Create a Pending proposal offering `requester_item` for `responder_item`.
    #[instrument(skip_all, fields(actor = %actor))]
    pub fn propose_swap(
        &self,
        actor: &UserId,
        requester_item: &ItemId,
        responder_item: &ItemId,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        let trees = &self.trees;
        let swap = (&trees.items, &trees.swaps, &trees.open_swaps).transaction(
            |(items, swaps, open_swaps)| {
                let offered = item::load_in(items, requester_item)?;
                let wanted = item::load_in(items, responder_item)?;

                if &offered.owner != actor || &wanted.owner == actor {
                    return Err(EngineError::Forbidden.into());
                }
                for item in [&offered, &wanted] {
                    if !item.is_available() {
                        return Err(EngineError::ItemNotAvailable(item.id.to_string()).into());
                    }
                }

                let swap = SwapProposal::new(
                    actor.clone(),
                    wanted.owner.clone(),
                    requester_item.clone(),
                    responder_item.clone(),
                );
                let open_key = swap.open_key();
                if open_swaps.get(&open_key)?.is_some() {
                    return Err(EngineError::DuplicateRequest.into());
                }

                open_swaps.insert(open_key, swap.id.as_bytes())?;
                store::tx_put(swaps, swap.id.as_bytes(), &swap)?;
                Ok(swap)
            },
        )?;

        info!(swap_id = %swap.id, responder = %swap.responder, "Swap proposed");

        let events = vec![NotificationEvent::new(
            swap.responder.clone(),
            NotificationKind::SwapRequest,
            Some(swap.id.clone()),
            format!(
                "You have a new swap request from {}",
                self.display_name(actor, "a user")
            ),
        )];
        Ok(self.commit(swap, events))
    }

    #[instrument(skip_all, fields(actor = %actor, swap_id = %swap_id))]
    pub fn respond_to_swap(
        &self,
        actor: &UserId,
        swap_id: &SwapId,
        response: SwapResponse,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        self.transition(actor, swap_id, response.into())
    }

    #[instrument(skip_all, fields(actor = %actor, swap_id = %swap_id))]
    pub fn cancel_swap(
        &self,
        actor: &UserId,
        swap_id: &SwapId,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        self.transition(actor, swap_id, SwapAction::Cancel)
    }

    fn transition(
        &self,
        actor: &UserId,
        swap_id: &SwapId,
        action: SwapAction,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        let trees = &self.trees;
        let swap = (&trees.items, &trees.swaps, &trees.open_swaps).transaction(
            |(items, swaps, open_swaps)| {
                let mut swap = load_swap_in(swaps, swap_id)?;
                let next = swap.next_status(actor, &action).or_abort()?;

                match &action {
                    SwapAction::Accept => {
                        // both or neither: an abort here discards the first reservation too
                        item::reserve_in(items, &swap.requester_item).map_err(as_conflict)?;
                        item::reserve_in(items, &swap.responder_item).map_err(as_conflict)?;
                    }
                    SwapAction::Counter(replacement) => {
                        let offered = item::load_in(items, replacement)?;
                        if offered.owner != swap.responder {
                            return Err(EngineError::Forbidden.into());
                        }
                        if !offered.is_available() {
                            return Err(
                                EngineError::ItemNotAvailable(replacement.to_string()).into()
                            );
                        }
                    }
                    SwapAction::Decline | SwapAction::Cancel => {}
                }

                if swap.status == SwapStatus::Pending {
                    open_swaps.remove(swap.open_key())?;
                }
                swap.commit(&action, next);
                store::tx_put(swaps, swap.id.as_bytes(), &swap)?;
                Ok(swap)
            },
        )?;

        info!(swap_id = %swap.id, status = %swap.status, "Swap {}", action.name());

        let events = self.transition_events(actor, &swap, &action);
        Ok(self.commit(swap, events))
    }

    fn transition_events(
        &self,
        actor: &UserId,
        swap: &SwapProposal,
        action: &SwapAction,
    ) -> Vec<NotificationEvent> {
        let name = self.display_name(actor, "the responder");
        let swap_id = Some(swap.id.clone());

        match action {
            SwapAction::Cancel => vec![NotificationEvent::new(
                swap.responder.clone(),
                NotificationKind::SwapCancelled,
                swap_id,
                format!(
                    "Swap request from {} was cancelled",
                    self.display_name(actor, "a user")
                ),
            )],
            SwapAction::Decline => vec![NotificationEvent::new(
                swap.requester.clone(),
                NotificationKind::SwapDeclined,
                swap_id,
                format!("Your swap request was declined by {name}"),
            )],
            SwapAction::Counter(_) => vec![NotificationEvent::new(
                swap.requester.clone(),
                NotificationKind::SwapCountered,
                swap_id,
                format!("Your swap request was countered by {name}"),
            )],
            SwapAction::Accept => {
                let offered = self.item_title(&swap.requester_item);
                let wanted = self.item_title(&swap.responder_item);
                vec![
                    NotificationEvent::new(
                        swap.requester.clone(),
                        NotificationKind::SwapAccepted,
                        swap_id.clone(),
                        format!(
                            "Your swap request with {name} has been accepted! Items: {offered} ↔ {wanted}"
                        ),
                    ),
                    NotificationEvent::new(
                        swap.responder.clone(),
                        NotificationKind::SwapAccepted,
                        swap_id,
                        format!("You accepted a swap. Items: {offered} ↔ {wanted}"),
                    ),
                ]
            }
        }
    }

    /// Append one chat message. The append happens inside a per-swap
    /// transaction, so concurrent messages from both parties are all kept.
    pub fn update_chat(
        &self,
        actor: &UserId,
        swap_id: &SwapId,
        text: &str,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        let (swap, party, message) = self.trees.swaps.transaction(|swaps| {
            let mut swap = load_swap_in(swaps, swap_id)?;
            let party = swap.ensure_chat_open(actor).or_abort()?;
            let message = ChatMessage::new(actor.clone(), text);
            swap.chat.push(message.clone());
            swap.updated_at = TimeStamp::new();
            store::tx_put(swaps, swap.id.as_bytes(), &swap)?;
            Ok((swap, party, message))
        })?;

        let events = vec![self.chat_event(&swap, party, &message)];
        Ok(self.commit(swap, events))
    }

    /// Replace the whole thread. Only a strictly longer thread counts as a new
    /// message, and the notification carries the last message alone.
    pub fn sync_chat(
        &self,
        actor: &UserId,
        swap_id: &SwapId,
        thread: Vec<ChatMessage>,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        let (swap, party, appended) = self.trees.swaps.transaction(|swaps| {
            let mut swap = load_swap_in(swaps, swap_id)?;
            let party = swap.ensure_chat_open(actor).or_abort()?;
            let appended = if thread.len() > swap.chat.len() {
                thread.last().cloned()
            } else {
                None
            };
            swap.chat = thread.clone();
            swap.updated_at = TimeStamp::new();
            store::tx_put(swaps, swap.id.as_bytes(), &swap)?;
            Ok((swap, party, appended))
        })?;

        let events = appended
            .map(|message| self.chat_event(&swap, party, &message))
            .into_iter()
            .collect();
        Ok(self.commit(swap, events))
    }

    fn chat_event(
        &self,
        swap: &SwapProposal,
        party: Party,
        message: &ChatMessage,
    ) -> NotificationEvent {
        NotificationEvent::new(
            swap.counterparty(party).clone(),
            NotificationKind::ChatMessage,
            Some(swap.id.clone()),
            format!(
                "{}: {}",
                self.display_name(&message.author, "Your swap partner"),
                message.text
            ),
        )
    }

    pub fn update_delivery_method(
        &self,
        actor: &UserId,
        swap_id: &SwapId,
        method: DeliveryMethod,
    ) -> Result<Committed<SwapProposal>, EngineError> {
        let swap = self.trees.swaps.transaction(|swaps| {
            let mut swap = load_swap_in(swaps, swap_id)?;
            swap.ensure_delivery_open(actor).or_abort()?;
            swap.delivery_method = method;
            swap.updated_at = TimeStamp::new();
            store::tx_put(swaps, swap.id.as_bytes(), &swap)?;
            Ok(swap)
        })?;

        info!(swap_id = %swap.id, method = ?method, "Delivery method set");
        Ok(self.commit(swap, vec![]))
    }

    pub fn swap(&self, id: &SwapId) -> Result<SwapProposal, EngineError> {
        store::get(&self.trees.swaps, id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("swap", id))
    }

    /// Every proposal the user is a party to, newest first.
    pub fn list_swaps(&self, user: &UserId) -> Result<Vec<SwapProposal>, EngineError> {
        let mut swaps: Vec<SwapProposal> = store::scan_all(&self.trees.swaps)?;
        swaps.retain(|swap| swap.party_of(user).is_some());
        swaps.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(swaps)
    }

    // Redemption

    pub fn redeem(
        &self,
        actor: &UserId,
        item_id: &ItemId,
    ) -> Result<Committed<Receipt>, EngineError> {
        let (receipt, item) = self.redemption.redeem(item_id, actor)?;

        let mut events = vec![];
        if self.config.notify_seller_on_redemption {
            events.push(NotificationEvent::new(
                receipt.body.seller.clone(),
                NotificationKind::ItemRedeemed,
                None,
                format!(
                    "{} redeemed your item {} for {} points",
                    self.display_name(actor, "A user"),
                    item.title,
                    receipt.body.points
                ),
            ));
        }
        Ok(self.commit(receipt, events))
    }

    pub fn receipt(&self, id: &str) -> Result<Receipt, EngineError> {
        self.redemption.receipt(id)
    }

    // Notifications

    /// The user's notifications, newest first. Pass the oldest id seen as
    /// `before` to page further back.
    pub fn list_notifications(
        &self,
        user: &UserId,
        before: Option<u64>,
    ) -> Result<Vec<Notification>, EngineError> {
        self.notifications
            .list(user, before.into(), self.config.notification_page_size)
    }

    pub fn list_notifications_page(
        &self,
        user: &UserId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<Vec<Notification>, EngineError> {
        self.notifications.list(user, cursor, limit)
    }

    pub fn mark_notification_read(
        &self,
        user: &UserId,
        id: u64,
    ) -> Result<Notification, EngineError> {
        self.notifications.mark_read(user, id)
    }

    fn commit<T>(&self, record: T, events: Vec<NotificationEvent>) -> Committed<T> {
        let undelivered = self.notifications.dispatch(events);
        Committed {
            record,
            undelivered,
        }
    }

    fn display_name(&self, id: &UserId, fallback: &str) -> String {
        match self.ledger.user(id) {
            Ok(user) if !user.name.is_empty() => user.name,
            _ => fallback.to_owned(),
        }
    }

    fn item_title(&self, id: &ItemId) -> String {
        self.items
            .get(id)
            .map(|item| item.title)
            .unwrap_or_else(|_| id.to_string())
    }
}

fn load_swap_in(swaps: &TransactionalTree, id: &SwapId) -> TxResult<SwapProposal> {
    store::tx_get(swaps, id.as_bytes())?
        .ok_or_else(|| EngineError::not_found("swap", id))
        .or_abort()
}

fn as_conflict(
    err: ConflictableTransactionError<EngineError>,
) -> ConflictableTransactionError<EngineError> {
    match err {
        ConflictableTransactionError::Abort(EngineError::ItemNotAvailable(_)) => {
            ConflictableTransactionError::Abort(EngineError::ConflictingReservation)
        }
        other => other,
    }
}

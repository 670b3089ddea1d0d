//! Swap proposal records and the negotiation state machine
use crate::error::EngineError;
use crate::types::{ItemId, SwapId, TimeStamp, UserId};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SwapStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Countered,
    #[n(2)]
    Accepted,
    #[n(3)]
    Declined,
    #[n(4)]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, minicbor::Encode, minicbor::Decode)]
pub enum DeliveryMethod {
    #[default]
    #[n(0)]
    Unset,
    #[n(1)]
    Meetup,
    #[n(2)]
    Shipping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapAction {
    Accept,
    Decline,
    Counter(ItemId),
    Cancel,
}

/// Which side of the proposal an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Requester,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ChatMessage {
    #[n(0)]
    pub author: UserId,
    #[n(1)]
    pub text: String,
    #[n(2)]
    pub sent_at: TimeStamp<Utc>,
}

impl ChatMessage {
    pub fn new(author: UserId, text: impl Into<String>) -> Self {
        Self {
            author,
            text: text.into(),
            sent_at: TimeStamp::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SwapProposal {
    #[n(0)]
    pub id: SwapId,
    #[n(1)]
    pub requester: UserId,
    #[n(2)]
    pub responder: UserId,
    #[n(3)]
    pub requester_item: ItemId,
    #[n(4)]
    pub responder_item: ItemId,
    #[n(5)]
    pub status: SwapStatus,
    #[n(6)]
    pub chat: Vec<ChatMessage>,
    #[n(7)]
    pub delivery_method: DeliveryMethod,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "pending",
            SwapStatus::Countered => "countered",
            SwapStatus::Accepted => "accepted",
            SwapStatus::Declined => "declined",
            SwapStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Accepted | SwapStatus::Declined | SwapStatus::Cancelled
        )
    }

    /// Negotiation is still running, or has settled and is being coordinated.
    pub fn is_live(&self) -> bool {
        !matches!(self, SwapStatus::Declined | SwapStatus::Cancelled)
    }

    /// The transition table. `None` means the action is not allowed from here.
    pub fn apply(&self, action: &SwapAction) -> Option<SwapStatus> {
        match (self, action) {
            (SwapStatus::Pending, SwapAction::Cancel)
            | (SwapStatus::Countered, SwapAction::Cancel) => Some(SwapStatus::Cancelled),
            (SwapStatus::Pending, SwapAction::Decline)
            | (SwapStatus::Countered, SwapAction::Decline) => Some(SwapStatus::Declined),
            (SwapStatus::Pending, SwapAction::Counter(_)) => Some(SwapStatus::Countered),
            (SwapStatus::Pending, SwapAction::Accept)
            | (SwapStatus::Countered, SwapAction::Accept) => Some(SwapStatus::Accepted),
            _ => None,
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SwapAction {
    pub fn name(&self) -> &'static str {
        match self {
            SwapAction::Accept => "accept",
            SwapAction::Decline => "decline",
            SwapAction::Counter(_) => "counter",
            SwapAction::Cancel => "cancel",
        }
    }

    /// Only the requester cancels; everything else belongs to the responder.
    pub fn actor(&self) -> Party {
        match self {
            SwapAction::Cancel => Party::Requester,
            SwapAction::Accept | SwapAction::Decline | SwapAction::Counter(_) => Party::Responder,
        }
    }
}

impl SwapProposal {
    pub fn new(
        requester: UserId,
        responder: UserId,
        requester_item: ItemId,
        responder_item: ItemId,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            id: SwapId::generate(),
            requester,
            responder,
            requester_item,
            responder_item,
            status: SwapStatus::Pending,
            chat: vec![],
            delivery_method: DeliveryMethod::Unset,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn party_of(&self, user: &UserId) -> Option<Party> {
        if user == &self.requester {
            Some(Party::Requester)
        } else if user == &self.responder {
            Some(Party::Responder)
        } else {
            None
        }
    }

    pub fn counterparty(&self, party: Party) -> &UserId {
        match party {
            Party::Requester => &self.responder,
            Party::Responder => &self.requester,
        }
    }

    /// Key of the duplicate-request guard while this proposal is Pending.
    pub fn open_key(&self) -> Vec<u8> {
        open_key(&self.requester, &self.responder_item)
    }

    /// Check the actor and the current status, returning the next status.
    /// Does not mutate: reservations and counter items are validated by the caller
    /// inside the same transaction that commits the result.
    pub fn next_status(&self, actor: &UserId, action: &SwapAction) -> Result<SwapStatus, EngineError> {
        match self.party_of(actor) {
            Some(party) if party == action.actor() => {}
            _ => return Err(EngineError::Forbidden),
        }

        self.status
            .apply(action)
            .ok_or(EngineError::InvalidTransition {
                from: self.status.as_str(),
                action: action.name(),
            })
    }

    /// Move to `status`, replacing the responder item on a counter.
    pub fn commit(&mut self, action: &SwapAction, status: SwapStatus) {
        if let SwapAction::Counter(item) = action {
            self.responder_item = item.clone();
        }
        self.status = status;
        self.updated_at = TimeStamp::new();
    }

    /// Chat stays open while the swap is live, including after acceptance.
    pub fn ensure_chat_open(&self, actor: &UserId) -> Result<Party, EngineError> {
        self.ensure_live(actor, "chat on")
    }

    /// Delivery can be agreed before or after acceptance.
    pub fn ensure_delivery_open(&self, actor: &UserId) -> Result<Party, EngineError> {
        self.ensure_live(actor, "arrange delivery for")
    }

    fn ensure_live(&self, actor: &UserId, action: &'static str) -> Result<Party, EngineError> {
        let party = self.party_of(actor).ok_or(EngineError::Forbidden)?;
        if !self.status.is_live() {
            return Err(EngineError::InvalidTransition {
                from: self.status.as_str(),
                action,
            });
        }
        Ok(party)
    }
}

pub fn open_key(requester: &UserId, responder_item: &ItemId) -> Vec<u8> {
    crate::utils::compound_key(requester.as_str(), responder_item.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> SwapProposal {
        SwapProposal::new(
            UserId::generate(),
            UserId::generate(),
            ItemId::generate(),
            ItemId::generate(),
        )
    }

    #[test]
    fn responder_counters_then_accepts() {
        let mut swap = proposal();
        let responder = swap.responder.clone();
        let replacement = ItemId::generate();
        let counter = SwapAction::Counter(replacement.clone());

        let next = swap.next_status(&responder, &counter).unwrap();
        swap.commit(&counter, next);
        assert_eq!(swap.status, SwapStatus::Countered);
        assert_eq!(swap.responder_item, replacement);

        let next = swap.next_status(&responder, &SwapAction::Accept).unwrap();
        assert_eq!(next, SwapStatus::Accepted);
    }

    #[test]
    fn roles_are_enforced() {
        let swap = proposal();
        let stranger = UserId::generate();

        assert!(matches!(
            swap.next_status(&swap.requester, &SwapAction::Accept),
            Err(EngineError::Forbidden)
        ));
        assert!(matches!(
            swap.next_status(&swap.responder, &SwapAction::Cancel),
            Err(EngineError::Forbidden)
        ));
        assert!(matches!(
            swap.next_status(&stranger, &SwapAction::Decline),
            Err(EngineError::Forbidden)
        ));
    }

    #[test]
    fn countered_swap_cannot_be_countered_again() {
        let mut swap = proposal();
        swap.status = SwapStatus::Countered;
        let err = swap
            .next_status(&swap.responder, &SwapAction::Counter(ItemId::generate()))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn chat_and_delivery_stay_open_while_live() {
        let mut swap = proposal();
        let stranger = UserId::generate();

        for status in [SwapStatus::Pending, SwapStatus::Countered, SwapStatus::Accepted] {
            swap.status = status;
            assert!(swap.ensure_chat_open(&swap.requester).is_ok());
            assert!(swap.ensure_delivery_open(&swap.requester).is_ok());
            assert!(swap.ensure_delivery_open(&swap.responder).is_ok());
            assert!(matches!(
                swap.ensure_delivery_open(&stranger),
                Err(EngineError::Forbidden)
            ));
        }

        swap.status = SwapStatus::Cancelled;
        assert!(swap.ensure_chat_open(&swap.requester).is_err());
        assert!(swap.ensure_delivery_open(&swap.requester).is_err());
    }

    #[test]
    fn proposal_encoding() {
        let mut swap = proposal();
        swap.chat.push(ChatMessage::new(swap.requester.clone(), "hi"));

        let encoding = minicbor::to_vec(&swap).unwrap();
        let decode: SwapProposal = minicbor::decode(&encoding).unwrap();

        assert_eq!(swap, decode);
    }
}

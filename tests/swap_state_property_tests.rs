//! Property-based tests for the swap negotiation state machine
//!
//! These tests drive `SwapProposal::next_status` and `SwapStatus::apply` with
//! random action sequences from random actors and check the table-level
//! invariants that the service relies on.
//!
//! What these tests DON'T cover (deliberately):
//!
//! - Item reservation and persistence (see the scenario and concurrency tests)
//! - Notification side effects

use proptest::prelude::*;
use swap_engine::{
    EngineError,
    swap::{Party, SwapAction, SwapProposal, SwapStatus},
    types::{ItemId, UserId},
};

/// Who performs an action
#[derive(Debug, Clone, Copy)]
enum Actor {
    Requester,
    Responder,
    Stranger,
}

fn actor_strategy() -> impl Strategy<Value = Actor> {
    prop_oneof![
        Just(Actor::Requester),
        Just(Actor::Responder),
        Just(Actor::Stranger)
    ]
}

fn action_strategy() -> impl Strategy<Value = SwapAction> {
    prop_oneof![
        Just(SwapAction::Accept),
        Just(SwapAction::Decline),
        Just(SwapAction::Cancel),
        any::<u8>().prop_map(|n| SwapAction::Counter(ItemId::from(format!("item_{n}")))),
    ]
}

fn status_strategy() -> impl Strategy<Value = SwapStatus> {
    prop_oneof![
        Just(SwapStatus::Pending),
        Just(SwapStatus::Countered),
        Just(SwapStatus::Accepted),
        Just(SwapStatus::Declined),
        Just(SwapStatus::Cancelled),
    ]
}

fn step_sequence_strategy() -> impl Strategy<Value = Vec<(Actor, SwapAction)>> {
    prop::collection::vec((actor_strategy(), action_strategy()), 1..=12)
}

fn proposal() -> SwapProposal {
    SwapProposal::new(
        UserId::generate(),
        UserId::generate(),
        ItemId::generate(),
        ItemId::generate(),
    )
}

fn user_for(swap: &SwapProposal, actor: Actor, stranger: &UserId) -> UserId {
    match actor {
        Actor::Requester => swap.requester.clone(),
        Actor::Responder => swap.responder.clone(),
        Actor::Stranger => stranger.clone(),
    }
}

proptest! {
    /// Property: terminal statuses accept no further action
    #[test]
    fn prop_terminal_states_are_final(action in action_strategy()) {
        for status in [SwapStatus::Accepted, SwapStatus::Declined, SwapStatus::Cancelled] {
            prop_assert!(status.is_terminal());
            prop_assert_eq!(status.apply(&action), None);
        }
    }

    /// Property: every allowed transition leaves Pending/Countered, and only
    /// a counter from Pending lands in Countered
    #[test]
    fn prop_transition_table_shape(status in status_strategy(), action in action_strategy()) {
        if let Some(next) = status.apply(&action) {
            prop_assert!(matches!(status, SwapStatus::Pending | SwapStatus::Countered));
            prop_assert_ne!(next, SwapStatus::Pending);
            if next == SwapStatus::Countered {
                prop_assert_eq!(status, SwapStatus::Pending);
                prop_assert!(matches!(action, SwapAction::Counter(_)));
            }
        }
    }

    /// Property: strangers are always forbidden, and the wrong party is
    /// forbidden regardless of status
    #[test]
    fn prop_roles_checked_before_status(status in status_strategy(), action in action_strategy()) {
        let mut swap = proposal();
        swap.status = status;
        let stranger = UserId::generate();

        prop_assert!(matches!(swap.next_status(&stranger, &action), Err(EngineError::Forbidden)));

        let wrong = match action.actor() {
            Party::Requester => swap.responder.clone(),
            Party::Responder => swap.requester.clone(),
        };
        prop_assert!(matches!(swap.next_status(&wrong, &action), Err(EngineError::Forbidden)));
    }

    /// Property: replaying a random sequence of actions through the state
    /// machine never leaves a terminal status, and the responder item only
    /// changes on a successful counter
    #[test]
    fn prop_random_sequences_respect_the_table(steps in step_sequence_strategy()) {
        let mut swap = proposal();
        let stranger = UserId::generate();

        for (actor, action) in steps {
            let before = swap.clone();
            let user = user_for(&swap, actor, &stranger);

            match swap.next_status(&user, &action) {
                Ok(next) => {
                    prop_assert!(!before.status.is_terminal());
                    swap.commit(&action, next);
                    match &action {
                        SwapAction::Counter(item) => prop_assert_eq!(&swap.responder_item, item),
                        _ => prop_assert_eq!(&swap.responder_item, &before.responder_item),
                    }
                }
                Err(EngineError::Forbidden) => {
                    prop_assert!(swap.party_of(&user) != Some(action.actor()));
                }
                Err(EngineError::InvalidTransition { .. }) => {
                    prop_assert_eq!(before.status.apply(&action), None);
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }

            if before.status.is_terminal() {
                prop_assert_eq!(swap.status, before.status);
            }
        }
    }
}

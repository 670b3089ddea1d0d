//! Races between independent request handlers
//!
//! Each test fires the same contended action from several threads at once and
//! checks that exactly the allowed number of them win.

use std::sync::Barrier;
use std::thread;
use swap_engine::{
    EngineError, ExchangeService, SwapResponse,
    config::EngineConfig,
    item::{Item, ItemStatus},
    ledger::User,
    swap::SwapStatus,
};

const CONTENDERS: usize = 8;

fn service() -> ExchangeService {
    ExchangeService::open(EngineConfig::temporary()).unwrap()
}

fn approved_item(service: &ExchangeService, owner: &User, title: &str, value: u64) -> Item {
    let item = service.list_item(&owner.id, title, Some(value)).unwrap();
    service.approve_item(&item.id).unwrap()
}

#[test]
fn concurrent_redemptions_reserve_an_item_once() {
    let service = service();
    let seller = service.register_user("seller").unwrap();
    let item = approved_item(&service, &seller, "vintage radio", 60);
    let buyers: Vec<User> = (0..CONTENDERS)
        .map(|n| service.register_user(&format!("buyer {n}")).unwrap())
        .collect();

    let barrier = Barrier::new(CONTENDERS);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = buyers
            .iter()
            .map(|buyer| {
                let (service, barrier, item) = (&service, &barrier, &item);
                s.spawn(move || {
                    barrier.wait();
                    service.redeem(&buyer.id, &item.id).map(|c| c.into_record())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::ItemNotAvailable(_)))
    );

    // only the winner paid
    let paid: Vec<_> = buyers
        .iter()
        .filter(|b| service.balance(&b.id).unwrap() == 40)
        .collect();
    assert_eq!(paid.len(), 1);
    assert_eq!(paid[0].id, winners[0].body.buyer);
    assert_eq!(service.item(&item.id).unwrap().status, ItemStatus::Reserved);
}

#[test]
fn concurrent_redemptions_never_overdraw_a_buyer() {
    let service = service();
    let seller = service.register_user("seller").unwrap();
    let buyer = service.register_user("buyer").unwrap();
    // each item alone is affordable, any two together are not
    let items: Vec<Item> = (0..CONTENDERS)
        .map(|n| approved_item(&service, &seller, &format!("lot {n}"), 60))
        .collect();

    let barrier = Barrier::new(CONTENDERS);
    let results: Vec<Result<_, EngineError>> = thread::scope(|s| {
        let handles: Vec<_> = items
            .iter()
            .map(|item| {
                let (service, barrier, buyer) = (&service, &barrier, &buyer);
                s.spawn(move || {
                    barrier.wait();
                    service.redeem(&buyer.id, &item.id).map(|_| ())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::InsufficientFunds { .. }))
    );
    assert_eq!(service.balance(&buyer.id).unwrap(), 40);

    let reserved = items
        .iter()
        .filter(|i| service.item(&i.id).unwrap().status == ItemStatus::Reserved)
        .count();
    assert_eq!(reserved, 1);
}

#[test]
fn concurrent_accepts_sharing_an_item_settle_once() {
    let service = service();
    let requester = service.register_user("requester").unwrap();
    let offered = approved_item(&service, &requester, "the only bike", 100);

    // the same item offered to several different responders
    let proposals: Vec<_> = (0..CONTENDERS)
        .map(|n| {
            let responder = service.register_user(&format!("responder {n}")).unwrap();
            let wanted = approved_item(&service, &responder, &format!("want {n}"), 100);
            let swap = service
                .propose_swap(&requester.id, &offered.id, &wanted.id)
                .unwrap()
                .into_record();
            (responder, wanted, swap)
        })
        .collect();

    let barrier = Barrier::new(CONTENDERS);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = proposals
            .iter()
            .map(|(responder, _, swap)| {
                let (service, barrier) = (&service, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    service.respond_to_swap(&responder.id, &swap.id, SwapResponse::Accept)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::ConflictingReservation))
    );

    let mut accepted = 0;
    for (_, wanted, swap) in &proposals {
        let stored = service.swap(&swap.id).unwrap();
        let wanted = service.item(&wanted.id).unwrap();
        match stored.status {
            SwapStatus::Accepted => {
                accepted += 1;
                assert_eq!(wanted.status, ItemStatus::Reserved);
            }
            SwapStatus::Pending => assert_eq!(wanted.status, ItemStatus::Available),
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(accepted, 1);
}

#[test]
fn accept_and_redeem_race_for_the_same_item() {
    let service = service();
    let requester = service.register_user("requester").unwrap();
    let responder = service.register_user("responder").unwrap();
    let buyer = service.register_user("buyer").unwrap();
    let offered = approved_item(&service, &requester, "lamp", 10);
    let wanted = approved_item(&service, &responder, "mirror", 10);
    let swap = service
        .propose_swap(&requester.id, &offered.id, &wanted.id)
        .unwrap()
        .into_record();

    let barrier = Barrier::new(2);
    let (accept, redeem) = thread::scope(|s| {
        let accept = s.spawn(|| {
            barrier.wait();
            service.respond_to_swap(&responder.id, &swap.id, SwapResponse::Accept)
        });
        let redeem = s.spawn(|| {
            barrier.wait();
            service.redeem(&buyer.id, &wanted.id)
        });
        (accept.join().unwrap(), redeem.join().unwrap())
    });

    // exactly one settlement wins the mirror
    assert!(accept.is_ok() ^ redeem.is_ok());
    if redeem.is_ok() {
        assert_eq!(service.swap(&swap.id).unwrap().status, SwapStatus::Pending);
        assert_eq!(
            service.item(&offered.id).unwrap().status,
            ItemStatus::Available
        );
        assert_eq!(service.balance(&buyer.id).unwrap(), 90);
    } else {
        assert_eq!(service.balance(&buyer.id).unwrap(), 100);
    }
}

#[test]
fn concurrent_chat_messages_are_all_kept() {
    let service = service();
    let requester = service.register_user("requester").unwrap();
    let responder = service.register_user("responder").unwrap();
    let offered = approved_item(&service, &requester, "book", 5);
    let wanted = approved_item(&service, &responder, "zine", 5);
    let swap = service
        .propose_swap(&requester.id, &offered.id, &wanted.id)
        .unwrap()
        .into_record();

    let barrier = Barrier::new(CONTENDERS);
    thread::scope(|s| {
        for n in 0..CONTENDERS {
            let author = if n % 2 == 0 { &requester } else { &responder };
            let (service, barrier, swap) = (&service, &barrier, &swap);
            s.spawn(move || {
                barrier.wait();
                service
                    .update_chat(&author.id, &swap.id, &format!("message {n}"))
                    .unwrap();
            });
        }
    });

    assert_eq!(service.swap(&swap.id).unwrap().chat.len(), CONTENDERS);
}

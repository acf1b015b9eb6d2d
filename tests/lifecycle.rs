//! Integration tests for the allocation lifecycle after distribution:
//! minting, pickup, expiry and the admin transitions.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use media_allocator::db::{
    exclusions, AccessorInfo, Allocation, AllocationStatus, NewItem, NewRecipient,
};
use media_allocator::services::{
    AllocatorEvent, DistributionOptions, DistributionOutcome, ExpiryOptions, MintedLink,
};
use media_allocator::{AllocatorDb, AllocatorError, Config, LinkError, Services};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 8, 30, 0).unwrap()
}

fn setup() -> (Arc<AllocatorDb>, Services) {
    let db = Arc::new(AllocatorDb::open_in_memory().unwrap());
    let services = Services::new(db.clone(), &Config::default(), true).unwrap();
    (db, services)
}

/// One recipient per name, one item per recipient, distributed at t0 + 1min
fn distributed(services: &Services, names: &[&str]) -> Vec<Allocation> {
    for (i, name) in names.iter().enumerate() {
        services.admin.add_recipient(&NewRecipient::new(*name, 1, 10)).unwrap();
        services
            .admin
            .add_item(&NewItem::new(format!("sha256-{:02}", i), 2048, format!("blobs/{}", i)).created_at(t0()))
            .unwrap();
    }

    match services
        .distribution
        .run_at(DistributionOptions::default(), t0() + Duration::minutes(1))
        .unwrap()
    {
        DistributionOutcome::Distributed(report) => report.allocations,
        other => panic!("expected a distribution, got {:?}", other),
    }
}

fn mint(services: &Services, allocation_id: i64, ttl: Duration, at: DateTime<Utc>) -> MintedLink {
    services.links.mint_at(allocation_id, ttl, at).unwrap()
}

fn link_class(result: Result<Allocation, AllocatorError>) -> Option<LinkError> {
    result.err().and_then(|e| e.link_class())
}

fn with_altered_secret(link: &MintedLink) -> String {
    let first = link.secret.chars().next().unwrap();
    let swapped = if first == 'A' { 'B' } else { 'A' };
    let altered = format!("{}{}", swapped, &link.secret[1..]);
    let url = link
        .url
        .replacen(&format!("/{}?", link.secret), &format!("/{}?", altered), 1);
    assert_ne!(url, link.url);
    url
}

fn accessor(addr: &str) -> AccessorInfo {
    AccessorInfo {
        remote_addr: Some(addr.to_string()),
        client_id: Some("courier/1.0".to_string()),
    }
}

#[test]
fn test_overdue_allocation_expires_with_cooldown() {
    let (db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    let minted_at = t0() + Duration::minutes(2);
    let link = mint(&services, allocation.id, Duration::hours(1), minted_at);
    let deadline = link.allocation.expires_at.unwrap();
    assert_eq!(deadline, minted_at + Duration::hours(1));

    let now = deadline + Duration::minutes(1);
    let report = services
        .expiry
        .run_at(ExpiryOptions { cooldown: Duration::days(14), page_size: 500 }, now)
        .unwrap();

    assert_eq!(report.summary.expired, 1);
    assert_eq!(report.run.stat("expired"), Some(1));
    assert_eq!(report.expired[0].id, allocation.id);

    let stored = services.admin.get_allocation(allocation.id).unwrap().unwrap();
    assert_eq!(stored.status, AllocationStatus::Expired);

    let entry = db
        .with_conn(|conn| exclusions::get_exclusion(conn, allocation.recipient_id, allocation.item_id))
        .unwrap()
        .unwrap();
    assert_eq!(entry.until, now + Duration::days(14));
}

#[test]
fn test_second_sweep_finds_nothing() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);
    mint(&services, allocation.id, Duration::hours(1), t0() + Duration::minutes(2));

    let first = services
        .expiry
        .run_at(ExpiryOptions::default(), t0() + Duration::hours(2))
        .unwrap();
    assert_eq!(first.summary.expired, 1);

    let second = services
        .expiry
        .run_at(ExpiryOptions::default(), t0() + Duration::hours(3))
        .unwrap();
    assert_eq!(second.summary.expired, 0);
    assert_eq!(second.run.stat("expired"), Some(0));
    assert!(second.run.is_finished());

    assert_eq!(services.admin.list_exclusions(None).unwrap().len(), 1);
}

#[test]
fn test_sweep_only_touches_notified_rows() {
    let (_db, services) = setup();
    let allocations = distributed(&services, &["ana", "ben", "cy"]);
    let (queued, picked, overdue) = (&allocations[0], &allocations[1], &allocations[2]);

    let picked_link = mint(&services, picked.id, Duration::hours(1), t0() + Duration::minutes(2));
    services
        .links
        .consume_at(&picked_link.url, &accessor("10.0.0.2"), t0() + Duration::minutes(3))
        .unwrap();
    mint(&services, overdue.id, Duration::hours(1), t0() + Duration::minutes(2));

    let report = services
        .expiry
        .run_at(ExpiryOptions::default(), t0() + Duration::days(2))
        .unwrap();

    assert_eq!(report.summary.expired, 1);
    let status = |id| services.admin.get_allocation(id).unwrap().unwrap().status;
    assert_eq!(status(queued.id), AllocationStatus::Queued);
    assert_eq!(status(picked.id), AllocationStatus::PickedUp);
    assert_eq!(status(overdue.id), AllocationStatus::Expired);
}

#[test]
fn test_sweep_pages_through_everything() {
    let (_db, services) = setup();
    let allocations = distributed(&services, &["a", "b", "c", "d", "e"]);
    for allocation in &allocations {
        mint(&services, allocation.id, Duration::hours(1), t0() + Duration::minutes(2));
    }

    let report = services
        .expiry
        .run_at(ExpiryOptions { cooldown: Duration::days(1), page_size: 2 }, t0() + Duration::hours(2))
        .unwrap();
    assert_eq!(report.summary.expired, 5);
}

#[test]
fn test_mint_then_authorize() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);
    let mut rx = services.events.subscribe();

    let minted_at = t0() + Duration::minutes(2);
    let link = mint(&services, allocation.id, Duration::hours(24), minted_at);

    assert!(link.url.starts_with(&format!("http://localhost:8090/pickup/{}/", allocation.id)));
    assert_eq!(link.allocation.status, AllocationStatus::Notified);
    assert_eq!(link.allocation.attempts, 1);
    assert_eq!(link.allocation.last_notified_at, Some(minted_at));
    assert!(!link.allocation.download_token.as_deref().unwrap().contains(&link.secret));
    assert_eq!(
        rx.try_recv().unwrap(),
        AllocatorEvent::AllocationNotified {
            allocation_id: allocation.id,
            recipient_id: allocation.recipient_id,
        }
    );

    let authorized = services
        .links
        .authorize_at(&link.url, minted_at + Duration::minutes(5))
        .unwrap();
    assert_eq!(authorized.id, allocation.id);

    let altered = with_altered_secret(&link);
    assert_eq!(
        link_class(services.links.authorize_at(&altered, minted_at + Duration::minutes(5))),
        Some(LinkError::Forbidden)
    );
}

#[test]
fn test_authorize_after_deadline_is_gone() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    let minted_at = t0() + Duration::minutes(2);
    let link = mint(&services, allocation.id, Duration::hours(1), minted_at);
    let late = minted_at + Duration::hours(2);

    assert_eq!(link_class(services.links.authorize_at(&link.url, late)), Some(LinkError::Gone));
    assert_eq!(
        link_class(services.links.authorize_at(&with_altered_secret(&link), late)),
        Some(LinkError::Gone)
    );
}

#[test]
fn test_lapsed_deadline_outranks_link_lifetime() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    // Default pickup window and link lifetime end at the same instant
    let minted_at = t0() + Duration::minutes(2);
    let link = mint(&services, allocation.id, Config::default().notify_ttl(), minted_at);
    let deadline = link.allocation.expires_at.unwrap();
    assert_eq!(link.link_expires_at, deadline);

    let late = deadline + Duration::minutes(1);
    assert_eq!(link_class(services.links.authorize_at(&link.url, late)), Some(LinkError::Gone));
    assert_eq!(
        link_class(services.links.authorize_at(&with_altered_secret(&link), late)),
        Some(LinkError::Gone)
    );

    let remint = services.links.mint_at(allocation.id, Duration::hours(1), late);
    assert_eq!(remint.err().and_then(|e| e.link_class()), Some(LinkError::Gone));
}

#[test]
fn test_remint_after_deadline_is_refused() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    let minted_at = t0() + Duration::minutes(2);
    let link = mint(&services, allocation.id, Duration::hours(1), minted_at);
    assert_eq!(link.allocation.attempts, 1);

    let err = services
        .links
        .mint_at(allocation.id, Duration::hours(1), minted_at + Duration::hours(2))
        .unwrap_err();
    assert_eq!(err.link_class(), Some(LinkError::Gone));

    // Nothing was written: old token, old deadline, no extra attempt
    let stored = services.admin.get_allocation(allocation.id).unwrap().unwrap();
    assert_eq!(stored.status, AllocationStatus::Notified);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.expires_at, Some(minted_at + Duration::hours(1)));
    assert_eq!(stored.download_token, link.allocation.download_token);
}

#[test]
fn test_link_past_its_own_lifetime_is_expired() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    // Pickup deadline outlives the seven day link lifetime
    let minted_at = t0() + Duration::minutes(2);
    let link = mint(&services, allocation.id, Duration::days(30), minted_at);
    assert_eq!(link.link_expires_at, minted_at + Duration::days(7));

    let err = services
        .links
        .authorize_at(&link.url, minted_at + Duration::days(8))
        .unwrap_err();
    assert_eq!(err.link_class(), Some(LinkError::Expired));
    assert!(err.link_class().unwrap().is_retryable());

    // A fresh link for the same allocation works again
    let fresh = mint(&services, allocation.id, Duration::days(30), minted_at + Duration::days(8));
    assert!(services
        .links
        .authorize_at(&fresh.url, minted_at + Duration::days(8))
        .is_ok());
}

#[test]
fn test_remint_never_extends_deadline() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    let t1 = t0() + Duration::minutes(2);
    let first = mint(&services, allocation.id, Duration::hours(1), t1);
    assert_eq!(first.allocation.expires_at, Some(t1 + Duration::hours(1)));

    let longer = mint(&services, allocation.id, Duration::hours(48), t1 + Duration::minutes(10));
    assert_eq!(longer.allocation.expires_at, Some(t1 + Duration::hours(1)));
    assert_eq!(longer.allocation.attempts, 2);
    // Status was already notified; the first stamp stays
    assert_eq!(longer.allocation.last_notified_at, Some(t1));

    let shorter = mint(&services, allocation.id, Duration::minutes(10), t1 + Duration::minutes(10));
    assert_eq!(shorter.allocation.expires_at, Some(t1 + Duration::minutes(20)));
    assert_eq!(shorter.allocation.attempts, 3);

    // Each mint replaces the stored hash
    let now = t1 + Duration::minutes(15);
    assert_eq!(link_class(services.links.authorize_at(&first.url, now)), Some(LinkError::Forbidden));
    assert!(services.links.authorize_at(&shorter.url, now).is_ok());
}

#[test]
fn test_mint_requires_queued_or_notified() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    let link = mint(&services, allocation.id, Duration::hours(1), t0() + Duration::minutes(2));
    services
        .links
        .consume_at(&link.url, &AccessorInfo::default(), t0() + Duration::minutes(3))
        .unwrap();

    let err = services
        .links
        .mint_at(allocation.id, Duration::hours(1), t0() + Duration::minutes(4))
        .unwrap_err();
    assert!(matches!(err, AllocatorError::InvalidTransition { .. }));

    assert!(matches!(
        services.links.mint_at(9999, Duration::hours(1), t0()),
        Err(AllocatorError::NotFound(_))
    ));
    assert!(matches!(
        services.links.mint_at(allocation.id, Duration::zero(), t0()),
        Err(AllocatorError::InvalidInput(_))
    ));
}

#[test]
fn test_consume_is_single_winner() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);
    let link = mint(&services, allocation.id, Duration::hours(1), t0() + Duration::minutes(2));
    let mut rx = services.events.subscribe();

    let at = t0() + Duration::minutes(5);
    let outcome = services.links.consume_at(&link.url, &accessor("10.0.0.7"), at).unwrap();
    assert!(outcome.first_pickup);
    assert_eq!(outcome.allocation.status, AllocationStatus::PickedUp);
    assert_eq!(outcome.receipt.remote_addr.as_deref(), Some("10.0.0.7"));
    assert_eq!(outcome.receipt.recorded_at, at);
    assert_eq!(
        rx.try_recv().unwrap(),
        AllocatorEvent::AllocationPickedUp {
            allocation_id: allocation.id,
            recipient_id: allocation.recipient_id,
        }
    );

    // The link no longer authorizes once picked up
    let again = services
        .links
        .consume_at(&link.url, &accessor("10.0.0.8"), at + Duration::seconds(1))
        .unwrap_err();
    assert_eq!(again.link_class(), Some(LinkError::Gone));

    // A repeated completion callback is accepted and recorded
    let repeat = services
        .links
        .on_consumed_at(allocation.id, &accessor("10.0.0.9"), at + Duration::seconds(2))
        .unwrap();
    assert!(!repeat.first_pickup);
    assert!(rx.try_recv().is_err());

    let receipts = services.admin.receipts(allocation.id).unwrap();
    let addrs: Vec<_> = receipts.iter().filter_map(|r| r.remote_addr.as_deref()).collect();
    assert_eq!(addrs, vec!["10.0.0.7", "10.0.0.9"]);
}

#[test]
fn test_on_consumed_outside_pickup_window_is_gone() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    let err = services
        .links
        .on_consumed_at(allocation.id, &AccessorInfo::default(), t0() + Duration::minutes(2))
        .unwrap_err();
    assert_eq!(err.link_class(), Some(LinkError::Gone));
    assert!(services.admin.receipts(allocation.id).unwrap().is_empty());
}

#[test]
fn test_reject_is_terminal() {
    let (_db, services) = setup();
    let allocations = distributed(&services, &["ana", "ben"]);
    let (notified, queued) = (&allocations[0], &allocations[1]);

    let link = mint(&services, notified.id, Duration::hours(1), t0() + Duration::minutes(2));
    let rejected = services.admin.reject_at(notified.id, t0() + Duration::minutes(3)).unwrap();
    assert_eq!(rejected.status, AllocationStatus::Rejected);
    assert_eq!(
        link_class(services.links.authorize_at(&link.url, t0() + Duration::minutes(4))),
        Some(LinkError::Gone)
    );

    assert_eq!(
        services.admin.reject(queued.id).unwrap().status,
        AllocationStatus::Rejected
    );
    assert!(matches!(
        services.admin.reject(queued.id),
        Err(AllocatorError::InvalidTransition { .. })
    ));
}

#[test]
fn test_return_to_pool_clears_pickup_state() {
    let (_db, services) = setup();
    let allocation = distributed(&services, &["ana"]).remove(0);

    assert!(matches!(
        services.admin.return_to_pool(allocation.id),
        Err(AllocatorError::InvalidTransition { .. })
    ));

    let link = mint(&services, allocation.id, Duration::hours(1), t0() + Duration::minutes(2));
    services
        .links
        .consume_at(&link.url, &AccessorInfo::default(), t0() + Duration::minutes(3))
        .unwrap();

    let back = services
        .admin
        .return_to_pool_at(allocation.id, t0() + Duration::minutes(4))
        .unwrap();
    assert_eq!(back.status, AllocationStatus::Queued);
    assert!(back.download_token.is_none());
    assert!(back.expires_at.is_none());
    assert!(back.last_notified_at.is_none());

    // Queued again: the old link is refused until a new one is minted
    assert_eq!(
        link_class(services.links.authorize_at(&link.url, t0() + Duration::minutes(5))),
        Some(LinkError::Forbidden)
    );
    let fresh = mint(&services, allocation.id, Duration::hours(1), t0() + Duration::minutes(6));
    assert!(services.links.authorize_at(&fresh.url, t0() + Duration::minutes(7)).is_ok());
}

#[test]
fn test_feeds_group_and_package() {
    let (_db, services) = setup();
    let allocations = distributed(&services, &["ana", "ben"]);

    let batches = services.feeds.notification_batches().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].recipient.name, "ana");
    assert_eq!(batches[0].allocations[0].id, allocations[0].id);

    let first = &allocations[0];
    let at = t0() + Duration::minutes(2);
    let packaged = services
        .feeds
        .package_at(first.run_id.unwrap(), first.recipient_id, Duration::hours(6), at)
        .unwrap();

    assert_eq!(packaged.len(), 1);
    assert_eq!(packaged[0].item.id, first.item_id);
    assert_eq!(packaged[0].link.allocation.status, AllocationStatus::Notified);
    assert!(services.links.authorize_at(&packaged[0].link.url, at).is_ok());

    // Only the other recipient still waits for a notification
    let batches = services.feeds.notification_batches().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].recipient.name, "ben");
}

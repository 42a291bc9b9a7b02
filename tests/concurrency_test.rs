mod common;

use chrono::{TimeDelta, Utc};
use common::*;
use royalty_sync::domain::{charge::ChargeStatus, id::Actor, provider::ProviderType};
use royalty_sync::infra::store::ChargeRepository;
use royalty_sync::services::reconciliation::ApplyResult;
use serde_json::json;
use std::{sync::Arc, time::Duration};

// 10 tasks create the same charge. One charge, one payable, every caller
// sees the same id.

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_converge_on_one_charge() {
    let adapter = FakeAdapter::new(ProviderType::Boleto).with_issue_delay(Duration::from_millis(50));
    let h = Arc::new(Harness::new(adapter).await);

    let mut handles = Vec::new();
    for i in 0..10 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.manager.create(&Actor::user(i), request(ProviderType::Boleto)).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(view) => ids.push(view.charge.id()),
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers see the same charge");
    assert_eq!(h.store.charges().await.len(), 1);
    assert_eq!(h.store.payables().await.len(), 1);
    assert_eq!(h.store.charges().await[0].status(), ChargeStatus::Submitted);
    assert_eq!(h.adapter.issue_count(), 1, "only the lease holder reaches the provider");
    assert_eq!(h.adapter.lookup_count(), 0);
}

// 10 tasks deliver the same event. Exactly one applies.

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_events() {
    let h = Arc::new(Harness::new(FakeAdapter::new(ProviderType::CardInvoice).with_reference("abc123")).await);
    let charge = h.manager.create(&Actor::user(1), request(ProviderType::CardInvoice)).await.unwrap().charge;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine
                .ingest_webhook(
                    ProviderType::CardInvoice,
                    &notification("evt_same", "abc123", "paid"),
                    json!({"id": "evt_same"}),
                    Utc::now(),
                )
                .await
                .unwrap()
        }));
    }

    let mut applied = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ApplyResult::Advanced { .. } => applied += 1,
            ApplyResult::Duplicate => duplicates += 1,
            other => panic!("unexpected result: {other:?}"),
        }
    }

    assert_eq!(applied, 1, "exactly 1 applied");
    assert_eq!(duplicates, 9, "9 duplicates");
    assert_eq!(h.store.webhook_event_count().await, 1);
    let after = h.store.get_charge(charge.id()).await.unwrap().unwrap();
    assert_eq!(after.status(), ChargeStatus::Paid);
}

// Different events racing on one charge: exactly one advances, the rest
// re-decide against the new version and end up unchanged.

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_distinct_events_serialize_per_charge() {
    let h = Arc::new(Harness::new(FakeAdapter::new(ProviderType::CardInvoice).with_reference("abc123")).await);
    let charge = h.manager.create(&Actor::user(1), request(ProviderType::CardInvoice)).await.unwrap().charge;

    let mut handles = Vec::new();
    for i in 0..5 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine
                .ingest_webhook(
                    ProviderType::CardInvoice,
                    &notification(&format!("evt_{i}"), "abc123", "paid"),
                    json!({}),
                    Utc::now(),
                )
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ApplyResult::Advanced { .. }) => applied += 1,
            Ok(ApplyResult::Unchanged) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    assert_eq!(applied, 1);
    let after = h.store.get_charge(charge.id()).await.unwrap().unwrap();
    assert_eq!(after.status(), ChargeStatus::Paid);
    assert_eq!(after.version(), charge.version() + 1, "status changed once");
}

// Webhook and sweep racing on the same charge end in one consistent state.

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webhook_and_sweep_race() {
    let h = Arc::new(Harness::new(FakeAdapter::new(ProviderType::CardInvoice).with_reference("abc123")).await);
    let charge = h.manager.create(&Actor::user(1), request(ProviderType::CardInvoice)).await.unwrap().charge;
    h.adapter.script_fetch([FetchStep::Status("paid")]);

    let sweep = {
        let h = h.clone();
        tokio::spawn(async move { h.sweeper.sweep_at(Utc::now() + chrono::TimeDelta::hours(2)).await })
    };
    let hook = {
        let h = h.clone();
        tokio::spawn(async move {
            h.engine
                .ingest_webhook(
                    ProviderType::CardInvoice,
                    &notification("evt_race", "abc123", "paid"),
                    json!({}),
                    Utc::now(),
                )
                .await
        })
    };

    sweep.await.unwrap().unwrap();
    hook.await.unwrap().unwrap();

    let after = h.store.get_charge(charge.id()).await.unwrap().unwrap();
    assert_eq!(after.status(), ChargeStatus::Paid);
    assert_eq!(after.version(), charge.version() + 1);
    assert!(after.next_poll_at().is_none());
}

// A webhook settles the charge while the sweep's fetch is in flight, then
// the fetch fails. The failure belongs to a charge that no longer exists in
// that state and must leave no trace.

async fn payment_lands_during_failed_fetch(failure: FetchStep, options: HarnessOptions) {
    let gate = Arc::new(FetchGate::default());
    let h = Arc::new(
        Harness::with_options(
            FakeAdapter::new(ProviderType::CardInvoice)
                .with_reference("abc123")
                .with_fetch_gate(gate.clone()),
            options,
        )
        .await,
    );
    let charge = h.manager.create(&Actor::user(1), request(ProviderType::CardInvoice)).await.unwrap().charge;
    h.adapter.script_fetch([failure]);

    let sweep = {
        let h = h.clone();
        tokio::spawn(async move { h.sweeper.sweep_at(Utc::now() + TimeDelta::hours(2)).await })
    };
    gate.entered.notified().await;

    let paid = h
        .engine
        .ingest_webhook(
            ProviderType::CardInvoice,
            &notification("evt_paid", "abc123", "paid"),
            json!({}),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(matches!(paid, ApplyResult::Advanced { to: ChargeStatus::Paid, .. }));
    gate.release.notify_one();

    let report = sweep.await.unwrap().unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(report.stalled, 0);

    let after = h.store.get_charge(charge.id()).await.unwrap().unwrap();
    assert_eq!(after.status(), ChargeStatus::Paid);
    assert!(!after.is_stalled());
    assert!(after.next_poll_at().is_none());
    assert_eq!(after.attempts_count(), 0);
    assert!(h.store.open_review_items().await.unwrap().is_empty(), "no review for a paid charge");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn provider_404_after_webhook_payment_is_dropped() {
    payment_lands_during_failed_fetch(FetchStep::Terminal, HarnessOptions::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_transient_failure_after_webhook_payment_does_not_stall() {
    payment_lands_during_failed_fetch(
        FetchStep::Transient,
        HarnessOptions {
            max_poll_attempts: 1,
            ..HarnessOptions::default()
        },
    )
    .await;
}

//! Regbot orchestrator tests
//!
//! Leadership is contested through the shared store; reconciliation
//! compares the directory against what is running.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{outbound_gateway, register_carrier, Harness};
use sbc_sidecar_core::config::{OptionsPingSettings, RegbotSettings};
use sbc_sidecar_core::directory::{Gateway, RegisterOutcome};
use sbc_sidecar_core::options_ping::{OptionsContext, OptionsPingFleet};
use sbc_sidecar_core::regbot::{PublicAddresses, RegbotContext, RegbotOrchestrator};
use sbc_sidecar_core::store::KeyValueStore;

fn orchestrator(harness: &Harness) -> RegbotOrchestrator {
    RegbotOrchestrator::new(RegbotContext::new(
        harness.services(),
        RegbotSettings::default(),
        PublicAddresses::new("203.0.113.5:5060"),
    ))
}

fn seed_one_carrier(harness: &Harness) {
    harness.directory.upsert_carrier(register_carrier("c1", "alice", "secret"));
    harness
        .directory
        .upsert_gateway(outbound_gateway("g1", "c1", "198.51.100.10"));
}

/// Nothing starts until this process holds the leadership key
#[tokio::test]
async fn test_reconcile_requires_leadership() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    let mut orch = orchestrator(&harness);

    assert!(!orch.reconcile().await.unwrap());
    assert!(orch.regbot_snapshots().is_empty());
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    let mut orch = orchestrator(&harness);

    assert!(orch.try_claim().await);
    assert!(orch.reconcile().await.unwrap());
    assert_eq!(orch.regbot_snapshots().len(), 1);

    assert!(!orch.reconcile().await.unwrap());
    assert!(!orch.reconcile().await.unwrap());
    assert_eq!(orch.stats().reconciliations, 1);
    assert_eq!(orch.stats().regbots_started, 1);

    orch.stop_all().await;
}

/// Any relevant change replaces the whole bot set
#[tokio::test]
async fn test_changed_carrier_restarts_bots() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    let mut orch = orchestrator(&harness);
    orch.try_claim().await;
    orch.reconcile().await.unwrap();

    harness.directory.upsert_carrier(register_carrier("c1", "alice", "rotated"));
    assert!(orch.reconcile().await.unwrap());

    let stats = orch.stats();
    assert_eq!(stats.reconciliations, 2);
    assert_eq!(stats.regbots_started, 2);
    assert_eq!(stats.regbots_stopped, 1);

    // an inactive gateway is not a target
    harness.directory.upsert_gateway(Gateway {
        is_active: false,
        ..outbound_gateway("g1", "c1", "198.51.100.10")
    });
    assert!(orch.reconcile().await.unwrap());
    assert!(orch.regbot_snapshots().is_empty());
}

#[tokio::test]
async fn test_duplicates_and_missing_passwords_are_skipped() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    harness
        .directory
        .upsert_gateway(outbound_gateway("g2", "c1", "198.51.100.10"));
    harness
        .directory
        .upsert_gateway(outbound_gateway("g3", "c1", "198.51.100.11"));
    harness.directory.upsert_carrier(register_carrier("c2", "bob", ""));
    harness
        .directory
        .upsert_gateway(outbound_gateway("g4", "c2", "198.51.100.12"));

    let mut orch = orchestrator(&harness);
    orch.try_claim().await;
    orch.reconcile().await.unwrap();

    let mut ips: Vec<String> = orch.regbot_snapshots().into_iter().map(|s| s.ipv4).collect();
    ips.sort();
    assert_eq!(ips, vec!["198.51.100.10".to_string(), "198.51.100.11".to_string()]);
    orch.stop_all().await;
}

/// Carriers that cannot build a bot get a failure status instead
#[tokio::test]
async fn test_invalid_realm_is_reported_on_the_carrier() {
    let harness = Harness::new();
    let mut carrier = register_carrier("c1", "alice", "secret");
    carrier.register_sip_realm = Some("not a realm!".into());
    harness.directory.upsert_carrier(carrier);
    harness
        .directory
        .upsert_gateway(outbound_gateway("g1", "c1", "198.51.100.10"));

    let mut orch = orchestrator(&harness);
    orch.try_claim().await;
    orch.reconcile().await.unwrap();

    assert!(orch.regbot_snapshots().is_empty());
    let history = harness.directory.register_status_history("c1");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RegisterOutcome::Fail);
    assert!(history[0].reason.contains("not a realm!"));
}

#[tokio::test]
async fn test_directory_failure_leaves_bots_running() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    let mut orch = orchestrator(&harness);
    orch.try_claim().await;
    orch.reconcile().await.unwrap();

    harness.directory.set_available(false);
    assert!(orch.reconcile().await.is_err());
    assert_eq!(orch.regbot_snapshots().len(), 1);

    harness.directory.set_available(true);
    assert!(!orch.reconcile().await.unwrap());
    orch.stop_all().await;
}

#[tokio::test]
async fn test_only_one_process_claims_leadership() {
    let harness = Harness::new();
    let mut first = orchestrator(&harness);
    let mut second = orchestrator(&harness);

    assert!(first.try_claim().await);
    assert!(!second.try_claim().await);
    assert!(first.is_active());
    assert!(!second.is_active());

    let stored = harness.store.get("test:regbot-token").await.unwrap();
    assert_eq!(stored.as_deref(), Some(first.leadership().token().as_str()));
}

/// A leader that finds another token in the key stops its bots
#[tokio::test]
async fn test_leader_stands_down_when_token_is_taken() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    let mut orch = orchestrator(&harness);
    let monitor = orch.monitor();

    orch.check_status().await;
    assert!(orch.is_active());
    assert!(monitor.is_active());
    assert_eq!(orch.regbot_snapshots().len(), 1);
    let epoch = monitor.epoch();

    harness
        .store
        .set("test:regbot-token", "someone-else", None)
        .await
        .unwrap();
    orch.check_status().await;

    assert!(!orch.is_active());
    assert!(!monitor.is_active());
    assert!(orch.regbot_snapshots().is_empty());
    assert!(monitor.regbot_snapshots().is_empty());
    assert_eq!(monitor.epoch(), epoch + 1);
}

/// A passive process claims the role once the key is vacated
#[tokio::test]
async fn test_passive_process_takes_over_vacated_role() {
    let harness = Harness::new();
    seed_one_carrier(&harness);
    harness
        .store
        .set("test:regbot-token", "someone-else", None)
        .await
        .unwrap();

    let mut orch = orchestrator(&harness);
    orch.check_status().await;
    assert!(!orch.is_active());
    assert!(orch.regbot_snapshots().is_empty());

    harness.store.delete("test:regbot-token").await.unwrap();
    orch.check_status().await;
    assert!(orch.is_active());
    assert_eq!(orch.regbot_snapshots().len(), 1);
    orch.stop_all().await;
}

/// The leader also owns the OPTIONS ping fleet
#[tokio::test]
async fn test_leader_drives_options_fleet() {
    let harness = Harness::new();
    harness.directory.upsert_gateway(Gateway {
        send_options_ping: true,
        ..outbound_gateway("g9", "c9", "198.51.100.90")
    });
    let fleet = OptionsPingFleet::new(OptionsContext::new(
        harness.services(),
        OptionsPingSettings::default(),
    ));
    let mut orch = orchestrator(&harness).with_options_fleet(fleet);

    orch.check_status().await;
    let uris = orch.options_fleet().map(|f| f.uris()).unwrap_or_default();
    assert_eq!(uris, vec!["sip:198.51.100.90:5060".to_string()]);

    orch.stop_all().await;
    assert!(orch.options_fleet().is_some_and(|f| f.is_empty()));
}

/// Ticks missed during a slow reconcile are not replayed back to back
#[tokio::test(start_paused = true)]
async fn test_slow_reconcile_does_not_burst_status_checks() {
    let harness = Harness::new();
    for (carrier_sid, ipv4) in [("c1", "198.51.100.10"), ("c2", "198.51.100.11")] {
        harness
            .directory
            .upsert_carrier(register_carrier(carrier_sid, "alice", "secret"));
        harness
            .directory
            .upsert_gateway(outbound_gateway(&format!("g-{}", carrier_sid), carrier_sid, ipv4));
    }

    // two bots with a 65s start delay: the first reconcile overruns the 60s interval
    let settings = RegbotSettings {
        max_initial_delay: Duration::ZERO,
        start_delay: Duration::from_secs(65),
        ..RegbotSettings::default()
    };
    let orch = RegbotOrchestrator::new(RegbotContext::new(
        harness.services(),
        settings,
        PublicAddresses::new("203.0.113.5:5060"),
    ));
    let monitor = orch.monitor();
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(orch.run(cancel.clone()));

    // claim at 0s, the missed 60s tick runs at 65s, the next one waits until 125s
    tokio::time::sleep_until(started + Duration::from_secs(122)).await;
    assert!(monitor.is_active());
    assert_eq!(monitor.regbot_snapshots().len(), 2);
    assert_eq!(harness.directory.carrier_lookups(), 2);

    tokio::time::sleep_until(started + Duration::from_secs(127)).await;
    assert_eq!(harness.directory.carrier_lookups(), 3);
    assert_eq!(monitor.stats().reconciliations, 1);

    cancel.cancel();
    task.await.unwrap();
}

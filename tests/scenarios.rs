use keeper::test_support::{stdout_logger, FakeMonitor, FakePostgres, StaticConfigLoader};
use keeper::{
    replication_slot_name, FileStateStore, InitMarker, InitMarkerFile, InitStage, Keeper,
    KeeperConfig, KeeperOptions, KeeperState, LivenessMarker, LoopExit, Lsn, NodeState, PeerNode,
    Signals, StandbyConnection,
};
use std::convert::TryFrom;
use std::error::Error;
use std::sync::Arc;
use tokio::time::Duration;

struct Harness {
    keeper: Keeper,
    postgres: Arc<FakePostgres>,
    monitor: Arc<FakeMonitor>,
    _dir: tempfile::TempDir,
}

fn harness(postgres: FakePostgres, monitor: FakeMonitor) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let options = KeeperOptions {
        node_name: Some("node_a".to_string()),
        node_host: Some("10.0.0.1".to_string()),
        node_port: Some(5432),
        data_directory: Some(dir.path().join("data")),
        sleep_interval: Some(Duration::from_millis(10)),
        network_partition_timeout: Some(Duration::from_secs(1)),
        ..KeeperOptions::default()
    };
    let config = KeeperConfig::try_from(options.clone()).unwrap();

    let postgres = Arc::new(postgres);
    let monitor = Arc::new(monitor);
    let keeper = Keeper::new(
        stdout_logger(),
        config,
        postgres.clone(),
        postgres.clone(),
        monitor.clone(),
        Arc::new(StaticConfigLoader::new(options)),
        Signals::new(),
    )
    .unwrap();

    Harness {
        keeper,
        postgres,
        monitor,
        _dir: dir,
    }
}

/// Put the node in a given persisted role, as if a previous service run
/// left it there, and claim the pid marker for this process.
fn seed_state(config: &KeeperConfig, role: NodeState, node_id: i64) -> KeeperState {
    let mut state = KeeperState::new(role, node_id, 0);
    state.system_identifier = 0;
    FileStateStore::new(&config.state_file).save(&state).unwrap();
    LivenessMarker::new(&config.pid_file).create().unwrap();
    state
}

fn peer(node_id: i64, host: &str) -> PeerNode {
    PeerNode {
        node_id,
        node_name: format!("node_{}", node_id),
        host: host.to_string(),
        port: 5432,
        current_role: NodeState::Secondary,
        reported_lsn: Lsn::zero(),
    }
}

#[tokio::test]
async fn fresh_node_becomes_single() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Single]);
    let mut h = harness(FakePostgres::empty(5432), monitor);

    h.keeper.initialize().await?;
    let outcome = h.keeper.run_loop_once().await?;

    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Single);
    assert!(h.postgres.is_running());
    assert!(h.postgres.database_created());
    assert!(h.postgres.has_replication_user("replicator"));
    assert!(h.monitor.published_system_identifier().is_some());

    // The first report went out before the transition, as an init node
    // with no database yet.
    let reports = h.monitor.reports();
    assert_eq!(reports[0].current_role, NodeState::Init);
    assert!(!reports[0].pg_is_running);

    // Re-running the loop with the same assignment is a no-op.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(!outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Single);
    Ok(())
}

#[tokio::test]
async fn peer_added_prepares_replication() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::WaitPrimary]);
    monitor.set_peers(vec![peer(7, "10.0.0.7")]);
    let mut h = harness(FakePostgres::running_primary(5432, 7_000_000_000_000_000_001), monitor);
    seed_state(&h.keeper.config, NodeState::Single, 1);

    let outcome = h.keeper.run_loop_once().await?;

    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::WaitPrimary);
    assert!(h.postgres.has_access_rule("10.0.0.7"));
    assert!(h.postgres.has_slot(&replication_slot_name(7)));
    Ok(())
}

#[tokio::test]
async fn transition_retry_after_crash_converges() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::WaitPrimary]);
    monitor.set_peers(vec![peer(7, "10.0.0.7")]);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Single, 1);

    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert!(h.postgres.has_slot(&replication_slot_name(7)));

    // Simulate a crash after the transition ran but before the new role
    // was persisted: put the old role back on disk and retry the same
    // edge over the already-created slot and access rule.
    seed_state(&h.keeper.config, NodeState::Single, 1);
    h.monitor.assign(&[NodeState::WaitPrimary]);

    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::WaitPrimary);
    assert!(h.postgres.has_slot(&replication_slot_name(7)));
    Ok(())
}

#[tokio::test]
async fn isolated_primary_demotes_itself() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.set_reachable(false);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);

    let mut state = KeeperState::new(NodeState::Primary, 1, 0);
    let long_ago = chrono::Utc::now().timestamp() - 100;
    state.last_monitor_contact = long_ago;
    state.last_secondary_contact = long_ago;
    FileStateStore::new(&h.keeper.config.state_file).save(&state).unwrap();
    LivenessMarker::new(&h.keeper.config.pid_file).create().unwrap();

    // No connected standby, no monitor: the partition check forces the
    // demotion and the same tick stops the database.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert!(!outcome.monitor_reachable);
    assert_eq!(h.keeper.state.current_role, NodeState::DemoteTimeout);
    assert!(!h.postgres.is_running());

    // The monitor comes back and finishes the demotion.
    h.monitor.set_reachable(true);
    h.monitor.assign(&[NodeState::Demoted]);
    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Demoted);
    Ok(())
}

#[tokio::test]
async fn isolated_primary_with_connected_standby_stays_up() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.set_reachable(false);
    let postgres = FakePostgres::running_primary(5432, 1);
    postgres.set_connected_standbys(vec![StandbyConnection {
        application_name: "node_7".to_string(),
        sync_state: "sync".to_string(),
        reported_lsn: Lsn::new(42),
    }]);
    let mut h = harness(postgres, monitor);

    let mut state = KeeperState::new(NodeState::Primary, 1, 0);
    let long_ago = chrono::Utc::now().timestamp() - 100;
    state.last_monitor_contact = long_ago;
    state.last_secondary_contact = long_ago;
    FileStateStore::new(&h.keeper.config.state_file).save(&state).unwrap();
    LivenessMarker::new(&h.keeper.config.pid_file).create().unwrap();

    let outcome = h.keeper.run_loop_once().await?;
    assert!(!outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Primary);
    assert!(h.postgres.is_running());
    // The streaming standby refreshed the contact timestamp.
    assert!(h.keeper.state.last_secondary_contact > long_ago);
    Ok(())
}

#[tokio::test]
async fn promotion_never_overlaps_write_acceptance() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(7);
    monitor.assign(&[
        NodeState::PrepPromotion,
        NodeState::StopReplication,
        NodeState::WaitPrimary,
    ]);
    monitor.set_peers(vec![peer(1, "10.0.0.1")]);
    let mut h = harness(FakePostgres::running_standby(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Secondary, 7);

    // Standby in recovery: not accepting writes.
    assert!(!h.postgres.accepts_writes());

    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::PrepPromotion);
    assert!(!h.postgres.accepts_writes());

    // The write-block goes on before the promotion severs replication.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::StopReplication);
    assert!(!h.postgres.accepts_writes());

    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::WaitPrimary);
    assert!(h.postgres.accepts_writes());

    // read_only=on strictly before promote, promote strictly before
    // read_only=off: at no instant could both nodes accept writes.
    let events = h.postgres.events();
    let pos = |needle: &str| {
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing event {:?} in {:?}", needle, events))
    };
    assert!(pos("read_only:true") < pos("promote"));
    assert!(pos("promote") < pos("read_only:false"));
    Ok(())
}

#[tokio::test]
async fn undefined_assignment_makes_no_progress() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Secondary]);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Single, 1);

    // SINGLE -> SECONDARY has no edge; the tick completes (and persists)
    // but the role must not move.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(!outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Single);
    Ok(())
}

#[tokio::test]
async fn dropped_node_confirms_and_exits() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Dropped]);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Single, 1);

    let exit = tokio::time::timeout(Duration::from_secs(10), h.keeper.run_loop_forever())
        .await
        .expect("loop did not exit after being dropped")?;

    assert_eq!(exit, LoopExit::Dropped);
    assert_eq!(h.keeper.state.current_role, NodeState::Dropped);
    assert!(!h.postgres.is_running());

    // The drop was reported back to the monitor at least once.
    let dropped_reports = h
        .monitor
        .reports()
        .iter()
        .filter(|r| r.current_role == NodeState::Dropped)
        .count();
    assert!(dropped_reports >= 1);
    Ok(())
}

#[tokio::test]
async fn stop_signal_exits_the_loop() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Single]);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Single, 1);

    h.keeper.signals().request_stop();
    let exit = tokio::time::timeout(Duration::from_secs(5), h.keeper.run_loop_forever())
        .await
        .expect("loop ignored the stop signal")?;
    assert_eq!(exit, LoopExit::StopRequested);
    Ok(())
}

#[tokio::test]
async fn interrupted_initialization_resumes_without_reregistering() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(99);
    monitor.assign(&[NodeState::Single]);
    let mut h = harness(FakePostgres::empty(5432), monitor);

    // A previous run registered as node 1, recorded what it found on disk,
    // and crashed before the first transition finished.
    let mut state = KeeperState::new(NodeState::Init, 1, 0);
    state.assigned_role = NodeState::Single;
    FileStateStore::new(&h.keeper.config.state_file).save(&state)?;
    let marker_file = InitMarkerFile::new(&h.keeper.config.init_file);
    marker_file.save(&InitMarker::new(InitStage::Exists))?;

    h.keeper.initialize().await?;

    // No second registration: the persisted identity stands (the monitor
    // would have handed out 99) and the recorded stage is untouched.
    let resumed = FileStateStore::new(&h.keeper.config.state_file).load()?;
    assert_eq!(resumed.node_id, 1);
    assert_eq!(resumed.assigned_role, NodeState::Single);
    assert_eq!(marker_file.load()?.stage, InitStage::Exists);
    Ok(())
}

#[tokio::test]
async fn failing_primary_eventually_reports_not_running() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Primary]);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Primary, 1);
    h.postgres.fail_next_starts(10);

    for _ in 0..4 {
        h.keeper.run_loop_once().await?;
    }

    let reports = h.monitor.reports();
    // Three restart attempts fit in the grace budget, so the monitor is
    // not rushed into a failover...
    assert!(reports[0].pg_is_running);
    assert!(reports[1].pg_is_running);
    assert!(reports[2].pg_is_running);
    // ...but once it is spent the monitor hears the truth and can act.
    assert!(!reports[3].pg_is_running);
    Ok(())
}

#[tokio::test]
async fn sync_replication_waits_for_a_caught_up_standby() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Primary]);
    monitor.set_peers(vec![peer(7, "10.0.0.7")]);
    monitor.set_sync_expression("ANY 1 (node_7)");
    let postgres = FakePostgres::running_primary(5432, 1);
    postgres.set_current_lsn(Lsn::new(200));
    postgres.set_connected_standbys(vec![StandbyConnection {
        application_name: "node_7".to_string(),
        sync_state: "sync".to_string(),
        reported_lsn: Lsn::new(100),
    }]);
    let mut h = harness(postgres, monitor);
    seed_state(&h.keeper.config, NodeState::WaitPrimary, 1);

    // The standby is behind our WAL position: the edge does not complete
    // and the role stays put, visible to the monitor on the next report.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(!outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::WaitPrimary);

    // Once the standby confirms our position, the retried edge goes through.
    h.postgres.set_connected_standbys(vec![StandbyConnection {
        application_name: "node_7".to_string(),
        sync_state: "sync".to_string(),
        reported_lsn: Lsn::new(200),
    }]);
    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Primary);
    assert_eq!(
        h.postgres.sync_standby_names().as_deref(),
        Some("ANY 1 (node_7)")
    );
    Ok(())
}

#[tokio::test]
async fn chosen_candidate_fast_forwards_missing_wal() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::FastForward, NodeState::PrepPromotion]);
    monitor.set_most_advanced_standby(PeerNode {
        node_id: 9,
        node_name: "node_9".to_string(),
        host: "10.0.0.9".to_string(),
        port: 5432,
        current_role: NodeState::ReportLsn,
        reported_lsn: Lsn::new(500),
    });
    let postgres = FakePostgres::running_standby(5432, 1);
    postgres.set_current_lsn(Lsn::new(100));
    let mut h = harness(postgres, monitor);
    seed_state(&h.keeper.config, NodeState::ReportLsn, 1);

    // The missing WAL is pulled from the most advanced standby.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::FastForward);
    assert!(h
        .postgres
        .events()
        .iter()
        .any(|e| e == "fetch_wal:10.0.0.9:0/1F4"));

    // Then the standby configuration is shed ahead of the promotion.
    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::PrepPromotion);
    assert!(h.postgres.events().iter().any(|e| e == "cleanup_standby_mode"));
    Ok(())
}

#[tokio::test]
async fn peer_list_refreshes_when_membership_version_moves() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Single]);
    let mut h = harness(FakePostgres::running_primary(5432, 1), monitor);
    seed_state(&h.keeper.config, NodeState::Single, 1);

    h.keeper.run_loop_once().await?;
    assert!(h.keeper.peers().is_empty());
    let first_version = h.keeper.state.nodes_version;

    // Membership changes on the monitor; the next exchange notices the
    // bumped version and re-fetches the peer list.
    h.monitor.set_peers(vec![peer(7, "10.0.0.7")]);
    h.keeper.run_loop_once().await?;
    assert_eq!(h.keeper.peers().len(), 1);
    assert!(h.keeper.state.nodes_version > first_version);
    Ok(())
}

#[tokio::test]
async fn demoted_node_rejoins_as_standby() -> Result<(), Box<dyn Error>> {
    let monitor = FakeMonitor::new(1);
    monitor.assign(&[NodeState::Catchingup, NodeState::Secondary]);
    monitor.set_primary(peer(7, "10.0.0.7"));
    monitor.set_peers(vec![peer(7, "10.0.0.7")]);
    let postgres = FakePostgres::running_primary(5432, 1);
    let mut h = harness(postgres, monitor);
    seed_state(&h.keeper.config, NodeState::Demoted, 1);

    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Catchingup);
    assert!(h.postgres.is_running());

    let events = h.postgres.events();
    assert!(
        events.iter().any(|e| e == "rewind:10.0.0.7"),
        "expected a rewind attempt in {:?}",
        events
    );

    let outcome = h.keeper.run_loop_once().await?;
    assert!(outcome.transitioned);
    assert_eq!(h.keeper.state.current_role, NodeState::Secondary);
    // As a secondary we retain WAL for our fellow standbys.
    assert!(h.postgres.has_slot(&replication_slot_name(7)));
    Ok(())
}

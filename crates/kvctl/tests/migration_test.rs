//! Slot migration integration tests

mod common;

use std::time::Duration;

use common::{addrs, migration_config, MigrateBehavior, TestEnv, CLUSTER, NS};
use kvctl::metadata::{ClusterSpec, SlotRange, TOTAL_SLOTS};
use kvctl::migration::{MigrateRequest, MigrateTask, MigrationConfig};
use kvctl::node_client::MigratingState;
use kvctl::store::KeySpace;
use kvctl::task::{TaskQueryType, TaskStatus};
use kvctl::ErrorKind;

fn request(source: usize, target: usize, start: u32, end: u32) -> MigrateRequest {
    MigrateRequest {
        source,
        target,
        slots: vec![SlotRange::new(start, end)],
    }
}

/// Put a started task straight into the doing slot, as a crashed worker leaves it
async fn stage_doing(env: &TestEnv, task: &MigrateTask) {
    let store = env.topology.store();
    let keys = store.keys();
    store.delete(&keys.migrate_queue(NS, CLUSTER, &task.id)).await.unwrap();
    store
        .put_json(&keys.migrate_doing(NS, CLUSTER), task)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_move_slot_range() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());

    let task = migration
        .submit(NS, CLUSTER, request(0, 1, 100, 200))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.slot_count(), 101);
    let pending = migration.get_tasks(NS, CLUSTER, TaskQueryType::Pending).await.unwrap();
    assert_eq!(pending, vec![task.clone()]);

    assert_eq!(migration.process_once().await.unwrap(), 1);

    let updated = env.cluster().await;
    assert_eq!(
        updated.shards[0].slot_ranges,
        vec![SlotRange::new(0, 99), SlotRange::new(201, 8191)]
    );
    assert_eq!(
        updated.shards[1].slot_ranges,
        vec![SlotRange::new(100, 200), SlotRange::new(8192, TOTAL_SLOTS - 1)]
    );
    for shard in &updated.shards {
        assert_eq!(shard.migrating_slot, None);
        assert_eq!(shard.import_slot, None);
    }
    updated.check_invariants().unwrap();

    let source = &cluster.shards[0].nodes[0];
    let target = &cluster.shards[1].nodes[0];
    let calls = env.client.migrate_calls();
    assert_eq!(calls.len(), 101);
    for (call, slot) in calls.iter().zip(100..=200) {
        assert_eq!(call, &(source.addr.clone(), slot, target.id.clone()));
    }

    assert!(migration.get_tasks(NS, CLUSTER, TaskQueryType::Pending).await.unwrap().is_empty());
    assert!(migration.get_tasks(NS, CLUSTER, TaskQueryType::Doing).await.unwrap().is_empty());
    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, task.id);
    assert_eq!(history[0].status, TaskStatus::Success);
    assert_eq!(history[0].migrated, 101);

    assert_eq!(migration.process_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_requests_never_queue() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());

    let bad = [
        request(0, 1, 8000, 8300),
        request(0, 0, 100, 200),
        request(0, 5, 100, 200),
        request(3, 1, 100, 200),
        request(0, 1, 200, 100),
        request(0, 1, 100, TOTAL_SLOTS),
        MigrateRequest {
            source: 0,
            target: 1,
            slots: Vec::new(),
        },
    ];
    for req in bad {
        let err = migration.submit(NS, CLUSTER, req.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{:?}", req);
    }
    assert!(migration.get_tasks(NS, CLUSTER, TaskQueryType::Pending).await.unwrap().is_empty());

    let err = migration
        .submit(NS, "missing", request(0, 1, 100, 200))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_failed_transfer_keeps_ownership() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());
    env.client.fail_slot(150);

    migration
        .submit(NS, CLUSTER, request(0, 1, 100, 200))
        .await
        .unwrap();
    assert_eq!(migration.process_once().await.unwrap(), 1);

    let updated = env.cluster().await;
    for (before, after) in cluster.shards.iter().zip(&updated.shards) {
        assert_eq!(after.slot_ranges, before.slot_ranges);
        assert_eq!(after.migrating_slot, None);
        assert_eq!(after.import_slot, None);
    }
    assert_eq!(env.client.migrate_calls().len(), 51);

    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history[0].status, TaskStatus::Failed);
    assert!(history[0].error.contains("150"), "{}", history[0].error);
    assert_eq!(history[0].migrated, 50);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transfer_times_out() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());
    env.client.set_migrate_behavior(MigrateBehavior::Stall);

    migration.submit(NS, CLUSTER, request(0, 1, 10, 20)).await.unwrap();
    assert_eq!(migration.process_once().await.unwrap(), 1);

    let updated = env.cluster().await;
    assert_eq!(updated.shards[0].slot_ranges, cluster.shards[0].slot_ranges);
    assert!(!updated.shards[0].is_migrating());
    assert!(!updated.shards[1].is_migrating());
    assert_eq!(env.client.migrate_calls().len(), 1);

    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history[0].status, TaskStatus::Failed);
    assert!(history[0].error.contains("timed out"), "{}", history[0].error);
}

#[tokio::test]
async fn test_refused_transfer_fails_task() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());
    env.client.set_migrate_behavior(MigrateBehavior::Reject);

    migration.submit(NS, CLUSTER, request(0, 1, 10, 20)).await.unwrap();
    assert_eq!(migration.process_once().await.unwrap(), 1);

    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history[0].status, TaskStatus::Failed);
    assert!(history[0].error.contains("slot 10"), "{}", history[0].error);
    assert!(!env.cluster().await.shards[0].is_migrating());
}

#[tokio::test]
async fn test_queue_runs_in_order_and_revalidates() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());

    let first = migration.submit(NS, CLUSTER, request(0, 1, 10, 19)).await.unwrap();
    let second = migration.submit(NS, CLUSTER, request(0, 1, 20, 29)).await.unwrap();
    // valid when queued, but by its turn shard 0 no longer owns 15-29
    let third = migration.submit(NS, CLUSTER, request(0, 1, 15, 35)).await.unwrap();
    assert!(first.id < second.id && second.id < third.id);

    let pending = migration.get_tasks(NS, CLUSTER, TaskQueryType::Pending).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, vec![first.id.clone(), second.id.clone(), third.id.clone()]);

    assert_eq!(migration.process_once().await.unwrap(), 3);

    let slots: Vec<u32> = env.client.migrate_calls().iter().map(|c| c.1).collect();
    assert_eq!(slots, (10..=29).collect::<Vec<_>>());
    let updated = env.cluster().await;
    assert!(updated.shards[1].owns(&SlotRange::new(10, 29)));

    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    let outcome: Vec<_> = history.iter().map(|t| (t.id.clone(), t.status)).collect();
    assert_eq!(
        outcome,
        vec![
            (first.id, TaskStatus::Success),
            (second.id, TaskStatus::Success),
            (third.id, TaskStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn test_restart_after_ownership_moved() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());

    let mut task = migration
        .submit(NS, CLUSTER, request(0, 1, 100, 200))
        .await
        .unwrap();
    task.start();
    task.migrated = 101;
    stage_doing(&env, &task).await;
    env.topology
        .update_cluster(NS, CLUSTER, |cluster| {
            cluster.move_slots(0, 1, &[SlotRange::new(100, 200)])?;
            cluster.shards[0].migrating_slot = Some(200);
            cluster.shards[1].import_slot = Some(200);
            Ok(true)
        })
        .await
        .unwrap();

    assert_eq!(migration.process_once().await.unwrap(), 1);

    assert!(env.client.migrate_calls().is_empty());
    let updated = env.cluster().await;
    assert!(updated.shards[1].owns(&SlotRange::new(100, 200)));
    assert!(!updated.shards[0].is_migrating());
    assert!(!updated.shards[1].is_migrating());
    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TaskStatus::Success);
}

#[tokio::test]
async fn test_restart_resumes_from_progress() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());

    let mut task = migration
        .submit(NS, CLUSTER, request(0, 1, 100, 200))
        .await
        .unwrap();
    task.start();
    task.migrated = 50;
    stage_doing(&env, &task).await;

    assert_eq!(migration.process_once().await.unwrap(), 1);

    let slots: Vec<u32> = env.client.migrate_calls().iter().map(|c| c.1).collect();
    assert_eq!(slots, (150..=200).collect::<Vec<_>>());
    assert!(env.cluster().await.shards[1].owns(&SlotRange::new(100, 200)));
}

#[tokio::test]
async fn test_restart_trusts_node_only_for_sent_transfer() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());
    let source = cluster.shards[0].nodes[0].addr.clone();

    let mut task = migration
        .submit(NS, CLUSTER, request(0, 1, 100, 200))
        .await
        .unwrap();
    task.start();
    task.migrated = 50;
    task.transferring = Some(150);
    stage_doing(&env, &task).await;
    // the command for 150 went out and finished before the restart
    env.client.report_migrating(&source, 150, MigratingState::Success);

    assert_eq!(migration.process_once().await.unwrap(), 1);

    let slots: Vec<u32> = env.client.migrate_calls().iter().map(|c| c.1).collect();
    assert_eq!(slots, (151..=200).collect::<Vec<_>>());
    assert!(env.cluster().await.shards[1].owns(&SlotRange::new(100, 200)));
    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history[0].migrated, 101);
    assert_eq!(history[0].transferring, None);
}

#[tokio::test]
async fn test_slot_moved_back_and_forth_is_transferred_each_time() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());
    let first = cluster.shards[0].nodes[0].addr.clone();
    let second = cluster.shards[1].nodes[0].addr.clone();

    for (source, target) in [(0, 1), (1, 0), (0, 1)] {
        migration
            .submit(NS, CLUSTER, request(source, target, 100, 100))
            .await
            .unwrap();
        assert_eq!(migration.process_once().await.unwrap(), 1);
    }

    // shard 0's master still reports slot 100 done from the first move
    let calls: Vec<(String, u32)> = env
        .client
        .migrate_calls()
        .into_iter()
        .map(|(addr, slot, _)| (addr, slot))
        .collect();
    assert_eq!(calls, vec![(first.clone(), 100), (second, 100), (first, 100)]);
    assert_eq!(env.cluster().await.shard_for_slot(100), Some(1));
}

#[tokio::test]
async fn test_restart_after_recorded_failure() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());

    let mut task = migration
        .submit(NS, CLUSTER, request(0, 1, 100, 200))
        .await
        .unwrap();
    task.start();
    task.error = "node went away".to_string();
    stage_doing(&env, &task).await;
    env.topology
        .update_cluster(NS, CLUSTER, |cluster| {
            cluster.shards[0].migrating_slot = Some(120);
            cluster.shards[1].import_slot = Some(120);
            Ok(true)
        })
        .await
        .unwrap();

    assert_eq!(migration.process_once().await.unwrap(), 1);

    assert!(env.client.migrate_calls().is_empty());
    let updated = env.cluster().await;
    assert_eq!(updated.shards[0].slot_ranges, cluster.shards[0].slot_ranges);
    assert!(!updated.shards[0].is_migrating());
    assert!(!updated.shards[1].is_migrating());
    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history[0].status, TaskStatus::Failed);
    assert_eq!(history[0].error, "node went away");
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_keeps_task_in_doing() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let migration = env.migration(migration_config());
    migration.submit(NS, CLUSTER, request(0, 1, 100, 110)).await.unwrap();

    env.backend.fail_cas_on(&KeySpace::default().cluster(NS, CLUSTER));
    assert_eq!(migration.process_once().await.unwrap(), 0);

    let doing = migration.get_tasks(NS, CLUSTER, TaskQueryType::Doing).await.unwrap();
    assert_eq!(doing.len(), 1);
    assert_eq!(doing[0].status, TaskStatus::Doing);
    assert!(migration.get_tasks(NS, CLUSTER, TaskQueryType::Pending).await.unwrap().is_empty());

    env.backend.heal();
    assert_eq!(migration.process_once().await.unwrap(), 1);
    assert!(env.cluster().await.shards[1].owns(&SlotRange::new(100, 110)));
    let history = migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TaskStatus::Success);
}

#[tokio::test]
async fn test_clusters_migrate_independently() {
    let env = TestEnv::new().await;
    env.create_cluster(4, 2).await;
    let other = ClusterSpec {
        name: "cluster-2".to_string(),
        nodes: addrs(8)[4..].to_vec(),
        password: String::new(),
        replicas: 2,
    };
    env.topology.create_cluster(NS, &other, false).await.unwrap();
    let migration = env.migration(migration_config());

    migration.submit(NS, CLUSTER, request(0, 1, 0, 9)).await.unwrap();
    migration.submit(NS, "cluster-2", request(1, 0, 9000, 9009)).await.unwrap();

    assert_eq!(migration.process_once().await.unwrap(), 2);
    assert!(env.cluster().await.shards[1].owns(&SlotRange::new(0, 9)));
    let other = env.topology.load_cluster(NS, "cluster-2").await.unwrap().value;
    assert!(other.shards[0].owns(&SlotRange::new(9000, 9009)));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_cluster_does_not_block_others() {
    let env = TestEnv::new().await;
    let cluster = env.create_cluster(4, 2).await;
    let other = ClusterSpec {
        name: "cluster-2".to_string(),
        nodes: addrs(8)[4..].to_vec(),
        password: String::new(),
        replicas: 2,
    };
    env.topology.create_cluster(NS, &other, false).await.unwrap();
    env.client.stall_source(&cluster.shards[0].nodes[0].addr);
    let migration = env.migration(MigrationConfig {
        check_interval_ms: 10,
        slot_timeout_ms: 3_000,
        ..migration_config()
    });
    let handle = migration.clone().start(None);

    migration.submit(NS, CLUSTER, request(0, 1, 0, 9)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    migration.submit(NS, "cluster-2", request(1, 0, 9000, 9009)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let done = migration.get_tasks(NS, "cluster-2", TaskQueryType::History).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, TaskStatus::Success);
    let stuck = migration.get_tasks(NS, CLUSTER, TaskQueryType::Doing).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert!(migration.get_tasks(NS, CLUSTER, TaskQueryType::History).await.unwrap().is_empty());
    handle.abort();
}

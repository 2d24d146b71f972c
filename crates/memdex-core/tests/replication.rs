use std::time::Duration;

use memdex_core::{
    Memdex, MemdexContext, NamespaceConfig, ReplicationConfig, Replicator, StorageOpts,
};
use memdex_index::{IndexDef, IndexType};
use memdex_query::Query;
use memdex_types::{IndexOpts, KeyValueKind};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

fn master_with_ns(config: NamespaceConfig) -> (Memdex, MemdexContext) {
    let db = Memdex::with_config(config);
    let ctx = MemdexContext::new();
    db.open_namespace("items", StorageOpts::default(), &ctx)
        .unwrap();
    db.add_index(
        "items",
        IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
        &ctx,
    )
    .unwrap();
    db.add_index(
        "items",
        IndexDef::new("data", IndexType::Tree, KeyValueKind::String, IndexOpts::new()),
        &ctx,
    )
    .unwrap();
    (db, ctx)
}

fn hashes(master: &Memdex, slave: &Memdex, ns: &str) -> (u64, u64) {
    (
        master.ns_handle(ns).unwrap().load().data_hash(),
        slave.ns_handle(ns).unwrap().load().data_hash(),
    )
}

#[test]
fn test_online_replication() {
    let (master, ctx) = master_with_ns(NamespaceConfig::default());
    let slave = Memdex::new();
    let replicator = Replicator::start(&master, &slave, ReplicationConfig::default());

    for id in 0..50 {
        master
            .upsert("items", &format!(r#"{{"id": {id}, "data": "v{id}"}}"#), &ctx)
            .unwrap();
    }
    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));
    let (mh, sh) = hashes(&master, &slave, "items");
    assert_eq!(mh, sh);
    assert_eq!(
        slave.select(&Query::new("items"), &ctx).unwrap().count(),
        50
    );
    replicator.stop();
}

#[test]
fn test_wal_catch_up_after_offline_window() {
    let (master, ctx) = master_with_ns(NamespaceConfig::default());
    let slave = Memdex::new();

    // Initial sync, then take the slave offline.
    let replicator = Replicator::start(&master, &slave, ReplicationConfig::default());
    for id in 0..20 {
        master
            .upsert("items", &format!(r#"{{"id": {id}, "data": "before"}}"#), &ctx)
            .unwrap();
    }
    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));
    replicator.stop();

    // Offline: inserts, one index drop, some deletes.
    for id in 20..60 {
        master
            .upsert("items", &format!(r#"{{"id": {id}, "data": "offline"}}"#), &ctx)
            .unwrap();
    }
    master.drop_index("items", "data", &ctx).unwrap();
    for id in 0..10 {
        master
            .delete("items", &format!(r#"{{"id": {id}}}"#), &ctx)
            .unwrap();
    }

    // Reconnect and catch up through the WAL.
    let replicator = Replicator::start(&master, &slave, ReplicationConfig::default());
    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));

    let (mh, sh) = hashes(&master, &slave, "items");
    assert_eq!(mh, sh);
    let master_count = master.select(&Query::new("items"), &ctx).unwrap().count();
    let slave_count = slave.select(&Query::new("items"), &ctx).unwrap().count();
    assert_eq!(master_count, slave_count);
    assert_eq!(master_count, 50);
    // The slave reports the master's WAL position.
    assert_eq!(
        replicator.last_applied_lsn("items"),
        master.ns_handle("items").unwrap().load().last_lsn()
    );
    // The dropped index is gone on the slave too.
    let slave_defs = slave.ns_handle("items").unwrap().load().index_defs();
    assert!(!slave_defs.iter().any(|d| d.name == "data"));
    replicator.stop();
}

#[test]
fn test_force_sync_when_wal_ring_too_small() {
    // A tiny WAL ring forces the full-dump path.
    let config = NamespaceConfig {
        wal_size: 8,
        ..NamespaceConfig::default()
    };
    let (master, ctx) = master_with_ns(config);
    for id in 0..100 {
        master
            .upsert("items", &format!(r#"{{"id": {id}, "data": "x"}}"#), &ctx)
            .unwrap();
    }

    let slave = Memdex::new();
    let replicator = Replicator::start(&master, &slave, ReplicationConfig::default());
    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));
    let (mh, sh) = hashes(&master, &slave, "items");
    assert_eq!(mh, sh);
    replicator.stop();
}

#[test]
fn test_replaying_wal_range_twice_is_idempotent() {
    let (master, ctx) = master_with_ns(NamespaceConfig::default());
    for id in 0..30 {
        master
            .upsert("items", &format!(r#"{{"id": {id}, "data": "v"}}"#), &ctx)
            .unwrap();
    }
    let records = master
        .ns_handle("items")
        .unwrap()
        .load()
        .wal_after(memdex_types::Lsn::EMPTY)
        .unwrap();

    let slave = Memdex::new();
    slave
        .open_namespace("items", StorageOpts::default(), &ctx)
        .unwrap();
    let slave_ns = slave.ns_handle("items").unwrap();
    for pass in 0..2 {
        for record in &records {
            slave_ns
                .with_ns(|ns| ns.apply_wal_record(record).map(|_| ()))
                .unwrap();
        }
        let (mh, sh) = hashes(&master, &slave, "items");
        assert_eq!(mh, sh, "pass {pass}");
    }
}

#[test]
fn test_transaction_replication_stages_until_commit() {
    let (master, ctx) = master_with_ns(NamespaceConfig::default());
    let slave = Memdex::new();
    let replicator = Replicator::start(&master, &slave, ReplicationConfig::default());
    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));

    let mut tx = master.new_transaction("items").unwrap();
    for id in 0..25 {
        tx.upsert_json(format!(r#"{{"id": {id}, "data": "tx"}}"#))
            .unwrap();
    }
    master.commit_transaction(&mut tx, &ctx).unwrap();

    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));
    let (mh, sh) = hashes(&master, &slave, "items");
    assert_eq!(mh, sh);
    assert_eq!(
        slave.select(&Query::new("items"), &ctx).unwrap().count(),
        25
    );
    replicator.stop();
}

#[test]
fn test_namespace_filters_limit_replication() {
    let (master, ctx) = master_with_ns(NamespaceConfig::default());
    master
        .open_namespace("ignored", StorageOpts::default(), &ctx)
        .unwrap();
    master
        .add_index(
            "ignored",
            IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
            &ctx,
        )
        .unwrap();

    let slave = Memdex::new();
    let replicator = Replicator::start(
        &master,
        &slave,
        ReplicationConfig {
            namespaces: vec!["items".to_owned()],
            ..ReplicationConfig::default()
        },
    );
    master.upsert("items", r#"{"id": 1, "data": "x"}"#, &ctx).unwrap();
    master.upsert("ignored", r#"{"id": 1}"#, &ctx).unwrap();
    assert!(replicator.wait_synced("items", SYNC_TIMEOUT));

    assert!(slave.enum_namespaces(None).contains(&"items".to_owned()));
    assert!(!slave.enum_namespaces(None).contains(&"ignored".to_owned()));
    replicator.stop();
}

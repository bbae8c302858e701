//! Key-value durability across restarts
//!
//! Exercises the put → flush → reopen and delete → reopen paths through the
//! namespace manager, the way a server restart would drive them.

mod common;

use ferrodb::config::EngineConfig;
use ferrodb::spaces::{CreateSpace, Engine, EngineKind, SpaceManager};

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.bcrypt_cost = common::TEST_BCRYPT_COST;
    config
}

fn kv_space(name: &str) -> CreateSpace {
    CreateSpace {
        name: name.to_string(),
        engine_type: EngineKind::KeyValue,
        dimension: 0,
        index_type: String::new(),
        metric: String::new(),
        wal_enabled: Some(true),
    }
}

fn kv_engine(manager: &SpaceManager, name: &str) -> std::sync::Arc<ferrodb::kv::KvEngine> {
    match manager.get_space(name).unwrap().0 {
        Engine::KeyValue(engine) => engine,
        Engine::Vector(_) => panic!("expected key-value engine"),
    }
}

#[tokio::test]
async fn test_put_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();
        manager.create_space(kv_space("kv1")).unwrap();

        let engine = kv_engine(&manager, "kv1");
        engine.put("user:1", "alice").unwrap();
        assert_eq!(engine.get("user:1").unwrap(), "alice");
        manager.close_all();
    }

    let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();
    let engine = kv_engine(&manager, "kv1");
    assert_eq!(engine.get("user:1").unwrap(), "alice");
    manager.close_all();
}

#[tokio::test]
async fn test_delete_is_final_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();
        manager.create_space(kv_space("kv1")).unwrap();

        let engine = kv_engine(&manager, "kv1");
        engine.put("user:1", "alice").unwrap();
        engine.flush().unwrap();
        engine.delete("user:1").unwrap();
        manager.close_all();
    }

    let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();
    let engine = kv_engine(&manager, "kv1");
    let err = engine.get("user:1").unwrap_err().to_string();
    assert!(
        err == "key not found" || err == "key is deleted",
        "unexpected error: {err}"
    );
    manager.close_all();
}

#[tokio::test]
async fn test_unflushed_writes_recovered_from_wal() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();
        manager.create_space(kv_space("kv1")).unwrap();
        manager.close_all();
    }

    // A crash after the WAL fsync but before the data-file flush leaves
    // pending records behind
    {
        let wal = ferrodb::wal::Wal::open(dir.path().join("kv1").join("wal.db")).unwrap();
        wal.append(b"orphan", b"rescued").unwrap();
    }

    let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();
    let engine = kv_engine(&manager, "kv1");
    assert_eq!(engine.get("orphan").unwrap(), "rescued");
    manager.close_all();
}

#[tokio::test]
async fn test_namespace_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SpaceManager::open(dir.path(), engine_config()).unwrap();

    manager.create_space(kv_space("a")).unwrap();
    manager.create_space(kv_space("b")).unwrap();

    let a = kv_engine(&manager, "a");
    let b = kv_engine(&manager, "b");

    a.put("k", "in-a").unwrap();
    a.flush().unwrap();
    b.put("k", "in-b").unwrap();
    b.flush().unwrap();

    assert_eq!(a.get("k").unwrap(), "in-a");
    assert_eq!(b.get("k").unwrap(), "in-b");

    // Deleting in one space leaves the other untouched
    a.delete("k").unwrap();
    assert!(a.get("k").is_err());
    assert_eq!(b.get("k").unwrap(), "in-b");

    manager.close_all();
}

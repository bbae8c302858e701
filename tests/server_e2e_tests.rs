//! End-to-end session tests over the TCP wire protocol

mod common;

use std::collections::HashMap;

use common::{format_vector, ramp_vector, start_server, test_config, TestSession};
use ferrodb::auth::{Permission, Role};
use ferrodb::Server;

#[tokio::test]
async fn test_login_and_kv_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), 10).await;

    let mut session = TestSession::login(server.data_addr, "root", "rootpw").await;

    let reply = session
        .send(r#"{"type":"CREATE_SPACE","space":"kv1"}"#)
        .await;
    assert!(reply.contains("SPACE_CREATED"), "{reply}");

    let reply = session
        .send(r#"{"type":"PUT","space":"kv1","key":"user:1","value":"alice"}"#)
        .await;
    assert!(reply.contains(r#""status":"OK""#), "{reply}");

    let reply = session
        .send(r#"{"type":"GET","space":"kv1","key":"user:1"}"#)
        .await;
    assert!(reply.contains(r#""value":"alice""#), "{reply}");

    // Bad JSON keeps the session alive
    let reply = session.send("{not json").await;
    assert!(reply.contains("invalid query"), "{reply}");
    let reply = session
        .send(r#"{"type":"GET","space":"kv1","key":"user:1"}"#)
        .await;
    assert!(reply.contains(r#""value":"alice""#), "{reply}");

    server.shutdown();
}

#[tokio::test]
async fn test_login_failure_closes_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), 10).await;

    let mut session = TestSession::connect(server.data_addr).await;
    let reply = session
        .send(r#"{"username":"root","password":"wrong"}"#)
        .await;
    assert!(reply.contains("authentication failed"), "{reply}");
    assert!(session.read_line().await.is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_vector_commands_over_wire() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), 10).await;

    let mut session = TestSession::login(server.data_addr, "root", "rootpw").await;

    let reply = session
        .send(r#"{"type":"CREATE_SPACE","space":"vec1","engine_type":"vector","dimension":4,"index_type":"Flat","metric":"L2"}"#)
        .await;
    assert!(reply.contains("SPACE_CREATED"), "{reply}");

    for i in 0..20 {
        let line = format!(
            r#"{{"type":"INSERT_VECTOR","space":"vec1","key":"{}","value":"{}"}}"#,
            1000 + i,
            format_vector(&ramp_vector(i, 4))
        );
        let reply = session.send(&line).await;
        assert!(reply.contains("VECTOR_INSERTED"), "{reply}");
    }

    // Search results come back as a bare array sorted by distance
    let line = format!(
        r#"{{"type":"SEARCH_TOPK","space":"vec1","value":"{}","dimension":3}}"#,
        format_vector(&ramp_vector(7, 4))
    );
    let reply = session.send(&line).await;
    let hits: Vec<serde_json::Value> = serde_json::from_str(&reply).unwrap();
    assert_eq!(hits[0]["id"], 1007);
    assert_eq!(hits.len(), 3);

    let reply = session
        .send(r#"{"type":"GET_VECTOR","space":"vec1","key":"1007"}"#)
        .await;
    assert!(reply.contains(r#""value":"7,8,9,10""#), "{reply}");

    server.shutdown();
}

#[tokio::test]
async fn test_authorization_matrix_over_wire() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 10);
    common::seed_users(
        &config,
        &[(
            "u_read",
            "readpw",
            Role::User,
            HashMap::from([("ts1".to_string(), Permission::Read)]),
        )],
    );
    let server = Server::new(config).unwrap().start().await.unwrap();

    let mut admin = TestSession::login(server.data_addr, "root", "rootpw").await;
    admin.send(r#"{"type":"CREATE_SPACE","space":"ts1"}"#).await;

    let mut reader = TestSession::login(server.data_addr, "u_read", "readpw").await;

    // Read allowed; the key simply does not exist
    let reply = reader.send(r#"{"type":"GET","space":"ts1","key":"k"}"#).await;
    assert!(reply.contains("key not found"), "{reply}");

    // Writes forbidden
    let reply = reader
        .send(r#"{"type":"PUT","space":"ts1","key":"k","value":"v"}"#)
        .await;
    assert!(reply.contains("write permission denied"), "{reply}");
    let reply = reader
        .send(r#"{"type":"DELETE","space":"ts1","key":"k"}"#)
        .await;
    assert!(reply.contains("write permission denied"), "{reply}");

    // Admin-only command forbidden
    let reply = reader.send(r#"{"type":"LIST_SPACES"}"#).await;
    assert!(reply.contains("admin access required"), "{reply}");

    server.shutdown();
}

#[tokio::test]
async fn test_use_space_selects_default_target() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), 10).await;

    let mut session = TestSession::login(server.data_addr, "root", "rootpw").await;
    session.send(r#"{"type":"CREATE_SPACE","space":"kv1"}"#).await;

    let reply = session.send(r#"{"type":"USE_SPACE","space":"kv1"}"#).await;
    assert!(reply.contains("SPACE_CHANGED"), "{reply}");

    // No explicit space on the follow-up commands
    session
        .send(r#"{"type":"PUT","key":"k","value":"v"}"#)
        .await;
    let reply = session.send(r#"{"type":"GET","key":"k"}"#).await;
    assert!(reply.contains(r#""value":"v""#), "{reply}");

    server.shutdown();
}

//! End-to-end tests against in-process mock memcached servers

mod common;

use common::MockServer;
use petraclient::codec::{F_COMPRESSED, F_NUMERIC, F_SERIALIZED};
use petraclient::config::Config;
use petraclient::metrics::Op;
use petraclient::protocol::StatValue;
use petraclient::registry::ServerStatus;
use petraclient::{CacheError, Client, Key, Value};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn client_for(servers: &[&MockServer], tweak: impl FnOnce(&mut Config)) -> Client {
    let mut config = Config::default();
    config.client.servers = servers.iter().map(|s| s.spec()).collect();
    config.client.timeout_ms = 500;
    tweak(&mut config);
    Client::new(&config).unwrap()
}

/// Deterministic incompressible bytes
fn noise(len: usize) -> Vec<u8> {
    let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

#[tokio::test]
async fn test_greeting_end_to_end() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(client.set("greeting", "hello", 0).await.unwrap());
    assert_eq!(client.get("greeting").await.unwrap(), Some(Value::from("hello")));

    assert!(client.delete("greeting", None).await.unwrap());
    assert_eq!(client.get("greeting").await.unwrap(), None);
    assert!(!client.delete("greeting", None).await.unwrap());
}

#[tokio::test]
async fn test_value_round_trips() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    let nested = json!({"user": {"id": 7, "tags": ["a", "b"], "score": 1.5, "admin": null}});
    let cases = vec![
        ("int", Value::Int(-42)),
        ("short", Value::from("short string")),
        ("long", Value::from("s".repeat(40_960))),
        ("nested", Value::from(nested)),
        ("binary", Value::Bytes(noise(20_000))),
    ];

    for (key, value) in &cases {
        assert!(client.set(*key, value.clone(), 0).await.unwrap(), "{key}");
    }
    let found = client
        .get_multi(cases.iter().map(|(k, _)| *k))
        .await
        .unwrap();
    assert_eq!(found.len(), cases.len());
    for (key, value) in &cases {
        assert_eq!(&found[*key], value, "{key}");
    }

    assert_eq!(server.flags_of("int"), Some(F_NUMERIC));
    assert_eq!(server.raw("int").unwrap(), b"-42");
    assert_eq!(server.flags_of("short"), Some(0));
    assert_eq!(server.flags_of("long"), Some(F_COMPRESSED));
    assert!(server.raw("long").unwrap().len() < 40_960);
    assert_eq!(server.flags_of("nested").map(|f| f & F_SERIALIZED), Some(F_SERIALIZED));
    // does not shrink enough to be worth it
    assert_eq!(server.flags_of("binary"), Some(0));
}

#[tokio::test]
async fn test_compression_can_be_disabled() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |c| c.codec.compression = false);

    assert!(client.set("long", "s".repeat(40_960), 0).await.unwrap());
    assert_eq!(server.flags_of("long"), Some(0));
    assert_eq!(server.raw("long").unwrap().len(), 40_960);
}

#[tokio::test]
async fn test_add_and_replace() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(!client.replace("k", "v0", 0).await.unwrap());
    assert!(client.add("k", "v1", 0).await.unwrap());
    assert!(!client.add("k", "v2", 0).await.unwrap());
    assert_eq!(client.get("k").await.unwrap(), Some(Value::from("v1")));
    assert!(client.replace("k", "v3", 0).await.unwrap());
    assert_eq!(client.get("k").await.unwrap(), Some(Value::from("v3")));
}

#[tokio::test]
async fn test_incr_decr() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(client.set("counter", 5, 0).await.unwrap());
    assert_eq!(client.incr("counter", 3).await.unwrap(), Some(8));
    // never goes below zero
    assert_eq!(client.decr("counter", 10).await.unwrap(), Some(0));
    assert_eq!(client.get("counter").await.unwrap(), Some(Value::Int(0)));

    assert_eq!(client.incr("missing", 1).await.unwrap(), None);

    // non-numeric values answer with CLIENT_ERROR
    assert!(client.set("text", "abc", 0).await.unwrap());
    assert_eq!(client.incr("text", 1).await.unwrap(), None);
}

#[tokio::test]
async fn test_check_and_add_is_exclusive() {
    let server = MockServer::start().await;
    let client = Arc::new(client_for(&[&server], |_| {}));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client.check_and_add("lock", 60).await.unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Some(true) => winners += 1,
            Some(false) => {}
            None => panic!("check_and_add failed outright"),
        }
    }
    assert_eq!(winners, 1);

    let token = client.get("lock").await.unwrap().unwrap();
    assert!(token.as_str().unwrap().starts_with("Check-"));
}

#[tokio::test]
async fn test_partial_failure_with_stalled_server() {
    let servers = [
        MockServer::start().await,
        MockServer::start().await,
        MockServer::start().await,
    ];
    let client = client_for(&[&servers[0], &servers[1], &servers[2]], |c| {
        c.client.timeout_ms = 200;
    });

    let keys: Vec<String> = (0..60).map(|i| format!("item:{i}")).collect();
    let pairs: Vec<(String, String)> = keys.iter().map(|k| (k.clone(), format!("v-{k}"))).collect();
    assert!(client.set_many(pairs, 0).await.unwrap());

    let stalled = &servers[1];
    let owner: HashMap<String, String> = keys
        .iter()
        .map(|k| {
            let server = client.registry().select(&Key::from(k)).unwrap();
            (k.clone(), server.addr().to_string())
        })
        .collect();
    let on_stalled: Vec<&String> = keys.iter().filter(|k| owner[*k] == stalled.spec()).collect();
    assert!(!on_stalled.is_empty());

    stalled.set_stall(true);
    let started = Instant::now();
    let found = client.get_multi(keys.iter()).await.unwrap();
    let elapsed = started.elapsed();

    // one deadline for the whole call, not one per server
    assert!(elapsed < Duration::from_millis(200 + 300), "took {elapsed:?}");
    for key in &keys {
        if owner[key] == stalled.spec() {
            assert!(!found.contains_key(key));
        } else {
            assert_eq!(found[key], Value::from(format!("v-{key}")));
        }
    }

    let dead = client
        .registry()
        .servers()
        .into_iter()
        .find(|s| s.addr() == stalled.spec())
        .unwrap();
    assert!(matches!(
        dead.status(),
        ServerStatus::Dead { ref reason, .. } if reason == "execution timeout"
    ));

    // the dead server is left alone until its retry delay passes
    let requests = stalled.requests();
    let connections = stalled.connections();
    let again = client.get_multi(keys.iter()).await.unwrap();
    assert_eq!(stalled.requests(), requests);
    assert_eq!(stalled.connections(), connections);
    for key in keys.iter().filter(|k| owner[*k] != stalled.spec()) {
        assert!(again.contains_key(key));
    }
    assert_eq!(client.metrics().timeouts.get(), 1);
}

#[tokio::test]
async fn test_malformed_reply_is_a_miss() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(client.set("k", "v", 0).await.unwrap());
    server.set_malformed(true);
    assert_eq!(client.get("k").await.unwrap(), None);
    assert!(client.metrics().protocol_errors.get() >= 1);

    // one garbled reply does not take the server out of rotation
    server.set_malformed(false);
    assert!(client.registry().servers()[0].is_alive());
    assert_eq!(client.get("k").await.unwrap().unwrap(), "v");
    assert_eq!(client.metrics().servers_marked_dead.get(), 0);
}

#[tokio::test]
async fn test_corrupt_payload_is_salvaged() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    server.insert_raw("bad", F_COMPRESSED, b"definitely not zlib");
    assert_eq!(client.get("bad").await.unwrap(), None);

    let broken: Vec<String> = server
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("broken-"))
        .collect();
    assert_eq!(broken.len(), 1);
    assert_eq!(server.raw(&broken[0]).unwrap(), b"definitely not zlib");
    assert_eq!(client.metrics().restore_failures.get(), 1);
}

#[tokio::test]
async fn test_load_fills_misses_in_chunks() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |c| c.client.load_chunk = 2);

    assert!(client.set("user-1", "cached alice", 0).await.unwrap());

    let keys: Vec<Vec<String>> = (1..=5).map(|i| vec![i.to_string()]).collect();
    let asked = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&asked);
    let loaded = client
        .load("user", &keys, 60, move |missing: Vec<Vec<String>>| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().push(missing.clone());
                missing
                    .into_iter()
                    .map(|k| {
                        let v = Value::from(format!("loaded {}", k[0]));
                        (k, v)
                    })
                    .collect::<HashMap<_, _>>()
            }
        })
        .await
        .unwrap();

    assert_eq!(loaded.len(), 5);
    assert_eq!(loaded["user-1"], Value::from("cached alice"));
    assert_eq!(loaded["user-4"], Value::from("loaded 4"));

    let asked = asked.lock().clone();
    assert_eq!(
        asked,
        vec![
            vec![vec!["2".to_string()]],
            vec![vec!["3".to_string()], vec!["4".to_string()]],
            vec![vec!["5".to_string()]],
        ]
    );

    // written back for next time
    assert_eq!(server.raw("user-3").unwrap(), b"loaded 3");
}

#[tokio::test]
async fn test_load_multi_part_keys() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    let keys = vec![vec!["7".to_string(), "comments".to_string()]];
    let loaded = client
        .load("post", &keys, 0, |missing: Vec<Vec<String>>| async move {
            missing
                .into_iter()
                .map(|k| (k, Value::Int(3)))
                .collect::<HashMap<_, _>>()
        })
        .await
        .unwrap();
    assert_eq!(loaded["post-7/comments"], Value::Int(3));
    assert_eq!(server.flags_of("post-7/comments"), Some(F_NUMERIC));
}

#[tokio::test]
async fn test_set_many_slices() {
    let servers = [MockServer::start().await, MockServer::start().await];
    let client = client_for(&[&servers[0], &servers[1]], |c| c.client.set_many_slice = 7);

    let pairs: Vec<(String, i64)> = (0..100).map(|i| (format!("n{i}"), i)).collect();
    assert!(client.set_many(pairs, 0).await.unwrap());
    assert_eq!(servers[0].len() + servers[1].len(), 100);

    let found = client
        .get_multi((0..100).map(|i| format!("n{i}")))
        .await
        .unwrap();
    assert_eq!(found.len(), 100);
    assert_eq!(found["n57"], Value::Int(57));
}

#[tokio::test]
async fn test_delete_many() {
    let servers = [MockServer::start().await, MockServer::start().await];
    let client = client_for(&[&servers[0], &servers[1]], |_| {});

    for key in ["a", "b", "c", "d"] {
        assert!(client.set(key, key, 0).await.unwrap());
    }
    let result = client
        .delete_many(["a", "b", "missing", "d"])
        .await
        .unwrap();
    assert_eq!(result.len(), 4);
    assert!(result["a"]);
    assert!(result["b"]);
    assert!(!result["missing"]);
    assert!(result["d"]);
    assert_eq!(client.get("c").await.unwrap(), Some(Value::from("c")));
}

#[tokio::test]
async fn test_flush_all() {
    let servers = [MockServer::start().await, MockServer::start().await];
    let client = client_for(&[&servers[0], &servers[1]], |_| {});

    for i in 0..20 {
        assert!(client.set(format!("k{i}"), i, 0).await.unwrap());
    }
    assert_eq!(client.flush_all().await.unwrap(), Some(true));
    assert_eq!(servers[0].len() + servers[1].len(), 0);
    assert_eq!(client.get("k3").await.unwrap(), None);
}

#[tokio::test]
async fn test_server_stats() {
    let servers = [MockServer::start().await, MockServer::start().await];
    let client = client_for(&[&servers[0], &servers[1]], |_| {});

    let stats = client.server_stats().await.unwrap();
    assert_eq!(stats.len(), 2);
    let one = &stats[&servers[0].spec()];
    assert_eq!(one["pid"], StatValue::Int(4242));
    assert_eq!(one["version"], StatValue::Text("1.6.21-mock".into()));
    assert_eq!(one["rusage_user"].as_float(), Some(0.25));
    assert_eq!(one["rusage_system"].as_float(), Some(0.125));

    assert_eq!(client.server_reset_stats().await, Some(true));

    let items = client.server_item_stats().await.unwrap();
    assert_eq!(items[&servers[1].spec()]["items:1:number"], StatValue::Int(3));

    let slabs = client.server_slab_stats().await.unwrap();
    assert_eq!(slabs[&servers[0].spec()]["active_slabs"], StatValue::Int(1));

    let sizes = client.server_size_stats().await.unwrap();
    assert_eq!(sizes[&servers[0].spec()], vec!["STAT 96 3".to_string()]);
}

#[tokio::test]
async fn test_namespace_and_integer_keys() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |c| c.client.namespace = Some("app".into()));

    assert!(client.set("k", "v", 0).await.unwrap());
    assert!(client.set(42u64, "answer", 0).await.unwrap());
    assert!(server.raw("app:k").is_some());
    assert!(server.raw("app:42").is_some());
    assert_eq!(client.get(42u64).await.unwrap(), Some(Value::from("answer")));
}

#[tokio::test]
async fn test_urlencoded_keys() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |c| c.client.urlencode = true);

    assert!(client.set("with space", "v", 0).await.unwrap());
    assert!(server.raw("with%20space").is_some());
    assert_eq!(client.get("with space").await.unwrap(), Some(Value::from("v")));
}

#[tokio::test]
async fn test_get_or_set() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let value = client
            .get_or_set("expensive", 60, || async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                "computed"
            })
            .await
            .unwrap();
        assert_eq!(value, Value::from("computed"));
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connections_are_pooled() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(client.set("k", "v", 0).await.unwrap());
    for _ in 0..10 {
        assert!(client.get("k").await.unwrap().is_some());
    }
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_readonly_client() {
    let server = MockServer::start().await;
    let writer = client_for(&[&server], |_| {});
    let reader = client_for(&[&server], |c| c.client.readonly = true);

    assert!(writer.set("k", "v", 0).await.unwrap());
    assert_eq!(reader.get("k").await.unwrap(), Some(Value::from("v")));
    assert!(matches!(
        reader.set("k", "w", 0).await,
        Err(CacheError::ReadOnly)
    ));
    assert!(matches!(
        reader.check_and_add("lock", 0).await,
        Err(CacheError::ReadOnly)
    ));
}

#[tokio::test]
async fn test_delete_only_client() {
    let server = MockServer::start().await;
    let writer = client_for(&[&server], |_| {});
    let deleter = client_for(&[&server], |c| c.client.delete_only = true);

    assert!(writer.set("k", "v", 0).await.unwrap());
    assert_eq!(deleter.get("k").await.unwrap(), None);
    assert!(!deleter.set("other", "v", 0).await.unwrap());
    assert!(server.raw("other").is_none());
    assert_eq!(deleter.check_and_add("lock", 0).await.unwrap(), None);

    assert!(deleter.delete("k", None).await.unwrap());
    assert!(server.raw("k").is_none());
}

#[tokio::test]
async fn test_unreachable_server() {
    // bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = Config::default();
    config.client.servers = vec![format!("127.0.0.1:{port}")];
    let client = Client::new(&config).unwrap();

    // the failed connect is a miss and takes the server out of rotation
    assert_eq!(client.get("k").await.unwrap(), None);
    assert!(matches!(
        client.get("k").await,
        Err(CacheError::NoServerAvailable)
    ));
    assert_eq!(client.incr("k", 1).await.unwrap(), None);
    assert_eq!(client.check_and_add("k", 0).await.unwrap(), None);
    assert_eq!(client.metrics().servers_marked_dead.get(), 1);
}

#[tokio::test]
async fn test_invalid_input_is_raised() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(matches!(
        client.set("k", "v", 60 * 60 * 24 * 31).await,
        Err(CacheError::InvalidTtl(_))
    ));
    assert!(matches!(
        client.set("bad key", "v", 0).await,
        Err(CacheError::InvalidKey(_))
    ));
    assert!(matches!(
        client.get("x".repeat(300)).await,
        Err(CacheError::InvalidKey(_))
    ));
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn test_local_operation_stats() {
    let server = MockServer::start().await;
    let client = client_for(&[&server], |_| {});

    assert!(client.set("k", 1, 0).await.unwrap());
    assert!(client.set("k", 2, 0).await.unwrap());
    let _ = client.get("k").await.unwrap();

    let stats = client.stats();
    assert_eq!(stats[&Op::Set].count, 2);
    assert_eq!(stats[&Op::Get].count, 1);
    assert!(stats[&Op::Get].user_time >= 0.0);
    assert_eq!(client.metrics().get_hits.get(), 1);
}

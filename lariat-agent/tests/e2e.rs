//! End-to-end tests driving the real agent binary through local tunnels.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lariat::{Error, Group, Launch, Queue, Tunnel, Value};
use sha1::{Digest, Sha1};

fn agent_bin() -> String {
    env!("CARGO_BIN_EXE_lariat-agent").to_owned()
}

fn local_tunnel(host: &str) -> Arc<Tunnel> {
    Arc::new(Tunnel::new(
        host,
        Launch::local().agent_argv(vec![agent_bin()]),
    ))
}

fn sha1_hex(data: &[u8]) -> String {
    Sha1::digest(data)
        .iter()
        .fold(String::new(), |mut out, b| {
            use std::fmt::Write as _;
            let _ = write!(out, "{b:02x}");
            out
        })
}

#[tokio::test(flavor = "multi_thread")]
async fn local_echo() {
    let tunnel = local_tunnel("local-echo");
    tunnel.connect().await.unwrap();
    // connect() is idempotent.
    tunnel.connect().await.unwrap();

    let answer = tunnel.call("echo", vec![Value::Int(42)]).await.unwrap();
    assert_eq!(answer, Value::Int(42));
    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn close_and_reconnect() {
    let tunnel = local_tunnel("local-reconnect");
    tunnel.connect().await.unwrap();
    tunnel.close().await.unwrap();
    assert!(!tunnel.is_connected());

    tunnel.connect().await.unwrap();
    let answer = tunnel
        .call("echo", vec![Value::Str("again".into())])
        .await
        .unwrap();
    assert_eq!(answer, Value::Str("again".into()));
    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_errors_carry_the_host_and_text() {
    let tunnel = local_tunnel("local-err");
    tunnel.connect().await.unwrap();
    let err = tunnel.call("no_such_op", vec![]).await.unwrap_err();
    match &err {
        Error::Remote { host, tb } => {
            assert_eq!(host, "local-err");
            assert!(tb.contains("unknown operation"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_time_across_three_hosts() {
    let group = Group::new([
        local_tunnel("t1"),
        local_tunnel("t2"),
        local_tunnel("t3"),
    ]);
    let results = group.call("time", vec![]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results.successful().count(), 3);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    let mut hosts: Vec<&str> = results.successful().map(|(h, _)| h).collect();
    hosts.sort_unstable();
    assert_eq!(hosts, ["t1", "t2", "t3"]);
    for (_, value) in results.successful() {
        let t = value.as_float().unwrap();
        assert!((t - now).abs() < 2.0, "clock skew: {t} vs {now}");
    }
    group.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_hosts_do_not_abort_the_fanout() {
    let good1 = local_tunnel("ok1");
    let good2 = local_tunnel("ok2");
    let bad = Arc::new(Tunnel::new(
        "dead1",
        Launch::local().agent_argv(vec!["/no/such/agent-binary".to_owned()]),
    ));
    let group = Group::new([good1, bad, good2]);

    let results = group.call("echo", vec![Value::Int(7)]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results.successful().count(), 2);
    assert_eq!(results.failures().count(), 1);
    assert!(results.get("dead1").unwrap().is_err());
    assert!(group.connection_errors().contains_key("dead1"));
    assert!(results.raise_failures().is_err());
    group.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn put_then_fetch_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let local_src = dir.path().join("src.txt");
    std::fs::write(&local_src, b"hello\n").unwrap();
    let remote = dir.path().join("remote.txt").display().to_string();

    let tunnel = local_tunnel("local-files");
    tunnel.connect().await.unwrap();

    let put = tunnel
        .put(&local_src, Some(remote.clone()))
        .await
        .unwrap();
    assert_eq!(put.remote_path, remote);
    assert_eq!(put.size, 6);
    assert_eq!(put.sha1sum, sha1_hex(b"hello\n"));

    let fetched = tunnel
        .fetch(&remote, Some(dir.path().join("back.txt")))
        .await
        .unwrap();
    assert_eq!(fetched.size, 6);
    assert_eq!(fetched.sha1sum, sha1_hex(b"hello\n"));
    assert_eq!(std::fs::read(&fetched.local_path).unwrap(), b"hello\n");

    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn large_transfer_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let local_src = dir.path().join("big.bin");
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&local_src, &body).unwrap();
    let remote = dir.path().join("big-remote.bin").display().to_string();

    let tunnel = local_tunnel("local-big");
    tunnel.connect().await.unwrap();

    let put = tunnel.put(&local_src, Some(remote.clone())).await.unwrap();
    assert_eq!(put.size, body.len() as u64);

    // No local path: the fetch lands in a fresh temp file.
    let fetched = tunnel.fetch(&remote, None).await.unwrap();
    assert_eq!(fetched.size, body.len() as u64);
    assert_eq!(std::fs::read(&fetched.local_path).unwrap(), body);
    std::fs::remove_file(&fetched.local_path).unwrap();

    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resources_are_served_and_cached() {
    let tunnel = local_tunnel("local-res");
    tunnel
        .resources()
        .add_entry("conf/motd.txt", b"welcome\n".to_vec());
    tunnel.connect().await.unwrap();

    let bytes = tunnel
        .call("read_resource", vec![Value::Str("conf/motd.txt".into())])
        .await
        .unwrap();
    assert_eq!(bytes, Value::Bytes(b"welcome\n".to_vec()));

    let cached = tunnel
        .call("resource_cached", vec![Value::Str("conf/motd.txt".into())])
        .await
        .unwrap();
    assert_eq!(cached, Value::Bool(true));

    // A key the controller cannot resolve fails the op, not the tunnel.
    let err = tunnel
        .call("read_resource", vec![Value::Str("absent".into())])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
    let again = tunnel
        .call("echo", vec![Value::Int(5)])
        .await
        .unwrap();
    assert_eq!(again, Value::Int(5));

    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn depth_limit_names_every_hop() {
    let tunnel = local_tunnel("n1");
    tunnel.connect().await.unwrap();

    // n1's agent tries to reach n2; the chain is already at the limit.
    let err = tunnel
        .call(
            "nest_call",
            vec![
                Value::Str(agent_bin()),
                Value::Str("n2".into()),
                Value::Str("echo".into()),
                Value::Int(1),
            ],
        )
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("Depth limit of 2 exceeded at"), "{text}");
    assert!(text.contains("-> n1 -> n2"), "{text}");

    tunnel.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_runs_tunnels_in_parallel_but_fifos_in_order() {
    let a = local_tunnel("qa");
    let b = local_tunnel("qb");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    let queue = Queue::new();
    // Two half-second sleeps per tunnel: two seconds of work, about one
    // of wall clock.
    let handles = [
        queue.call(&a, "sleep_ms", vec![Value::Int(500)]),
        queue.call(&b, "sleep_ms", vec![Value::Int(500)]),
        queue.call(&a, "sleep_ms", vec![Value::Int(500)]),
        queue.call(&b, "sleep_ms", vec![Value::Int(500)]),
    ];

    let started = Instant::now();
    queue.run().await;
    let elapsed = started.elapsed();

    for handle in &handles {
        assert!(handle.value().unwrap().is_ok());
    }
    assert!(elapsed >= Duration::from_millis(950), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1900), "{elapsed:?}");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_group_call_joins_per_host_results() {
    let group = Group::new([local_tunnel("g1"), local_tunnel("g2")]);
    group.connect(false).await;

    let queue = Queue::new();
    let handle = queue.call(&group, "hostname", vec![]);
    queue.run().await;

    let results = handle.value().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results.successful().count(), 2);

    group.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_keeps_truthy_hosts() {
    let group = Group::new([local_tunnel("f1"), local_tunnel("f2")]);
    group.connect(false).await;

    // echo(true) keeps everyone; exclude inverts to nobody.
    let kept = group.filter("echo", vec![Value::Bool(true)], false).await.unwrap();
    assert_eq!(kept.len(), 2);
    let none = group.filter("echo", vec![Value::Bool(true)], true).await.unwrap();
    assert!(none.is_empty());

    group.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn group_fetch_writes_one_file_per_host() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("shared.txt");
    std::fs::write(&src, b"shared").unwrap();
    let remote = src.display().to_string();

    let group = Group::new([local_tunnel("d1"), local_tunnel("d2")]);
    let base: PathBuf = dir.path().join("down.txt");
    let results = group.fetch(&remote, Some(base.as_path())).await;
    results.raise_failures().unwrap();

    for host in ["d1", "d2"] {
        let path = dir.path().join(format!("down-{host}.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"shared");
    }
    group.close().await;
}

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use common::*;
use skein::cluster::packet::{pack, AuthRequest, AuthResponse, Ping};
use skein::cluster::{NodeName, NodeStatus, Packet};
use skein::settings::CHANNEL_BUFFER_SIZE;

#[tokio::test]
async fn test_single_node_has_quorum_and_hears_nothing() {
    let (manager, mut events, _addr) = start("node-a").await;

    assert!(recv(&mut events.quorum_state).await);
    assert!(manager.quorum());

    let health = BackendHealth {
        pool: "www".to_string(),
        online: true,
    };
    manager.broadcast(&health).await.unwrap();
    assert_silent(&mut events.from_cluster, Duration::from_millis(300)).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_two_nodes_join_and_exchange_messages() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());

    assert_eq!(recv(&mut a_events.node_join).await, NodeName::from("node-b"));
    assert_eq!(recv(&mut b_events.node_join).await, NodeName::from("node-a"));
    assert!(a.quorum());
    assert_eq!(a.connected_peers(), vec![NodeName::from("node-b")]);

    let health = BackendHealth {
        pool: "www".to_string(),
        online: false,
    };
    a.broadcast(&health).await.unwrap();
    let packet = recv(&mut b_events.from_cluster).await;
    assert_eq!(packet.name().as_str(), "node-a");
    assert_eq!(packet.data_type(), "healthcheck.BackendHealth");
    assert_eq!(packet.decode::<BackendHealth>().unwrap(), health);

    b.send_to("node-a", &health).await.unwrap();
    let packet = recv(&mut a_events.from_cluster).await;
    assert_eq!(packet.name().as_str(), "node-b");
    assert!(packet.is::<BackendHealth>());

    // pings keep flowing and are counted, never forwarded
    sleep(Duration::from_millis(300)).await;
    let report = a
        .node_reports()
        .into_iter()
        .find(|r| r.name.as_str() == "node-b")
        .unwrap();
    assert_eq!(report.status, NodeStatus::Online);
    assert!(report.packets >= 2);
    assert!(report.join_time.is_some());
    assert_silent(&mut a_events.from_cluster, Duration::from_millis(100)).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_wrong_secret_never_joins() {
    let (a, mut a_events, a_addr) = start_with_secret("node-a", "right").await;
    let (b, mut b_events, b_addr) = start_with_secret("node-b", "wrong").await;
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());

    // several dial rounds from both sides
    sleep(Duration::from_millis(800)).await;
    assert!(a_events.node_join.try_recv().is_err());
    assert!(b_events.node_join.try_recv().is_err());
    assert!(a.connected_peers().is_empty());
    assert!(b.connected_peers().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_everyone_but_the_sender() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    let (c, mut c_events, c_addr) = start("node-c").await;
    a.add_peer("node-b", b_addr.to_string());
    a.add_peer("node-c", c_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());
    b.add_peer("node-c", c_addr.to_string());
    c.add_peer("node-a", a_addr.to_string());
    c.add_peer("node-b", b_addr.to_string());

    wait_until("every node sees two peers", || {
        [&a, &b, &c]
            .iter()
            .all(|manager| manager.connected_peers().len() == 2)
    })
    .await;
    // let duplicate connections settle
    sleep(Duration::from_millis(200)).await;

    let health = BackendHealth {
        pool: "api".to_string(),
        online: true,
    };
    a.broadcast(&health).await.unwrap();

    for events in [&mut b_events, &mut c_events] {
        let packet = recv(&mut events.from_cluster).await;
        assert_eq!(packet.name().as_str(), "node-a");
        assert_eq!(packet.decode::<BackendHealth>().unwrap(), health);
    }
    assert_silent(&mut a_events.from_cluster, Duration::from_millis(300)).await;

    for manager in [a, b, c] {
        manager.shutdown().await;
    }
}

#[tokio::test]
async fn test_silent_peer_leaves_exactly_once() {
    let (a, mut a_events, a_addr) = start("node-a").await;

    // a hand-rolled client that authenticates and then never says anything
    let stream = TcpStream::connect(a_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let request = pack(
        &AuthRequest {
            key: SECRET.to_string(),
        },
        &"silent".into(),
    )
    .unwrap();
    write_half.write_all(&request).await.unwrap();

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    timeout(WAIT, reader.read_until(b'\n', &mut line))
        .await
        .unwrap()
        .unwrap();
    let response: AuthResponse = Packet::unpack(&line).unwrap().decode().unwrap();
    assert!(response.ok);
    assert!(response.time.is_some());

    assert_eq!(recv(&mut a_events.node_join).await, NodeName::from("silent"));
    assert_eq!(recv(&mut a_events.node_leave).await, NodeName::from("silent"));
    assert!(a.connected_peers().is_empty());
    assert_silent(&mut a_events.node_leave, Duration::from_millis(700)).await;

    drop(write_half);
    a.shutdown().await;
}

#[tokio::test]
async fn test_ping_from_raw_client_records_lag() {
    let (a, mut a_events, a_addr) = start("node-a").await;

    let stream = TcpStream::connect(a_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let sender = NodeName::from("pinger");
    let request = pack(
        &AuthRequest {
            key: SECRET.to_string(),
        },
        &sender,
    )
    .unwrap();
    write_half.write_all(&request).await.unwrap();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    timeout(WAIT, reader.read_until(b'\n', &mut line))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(recv(&mut a_events.node_join).await, sender);
    let sent = Utc::now() - chrono::Duration::milliseconds(250);
    let ping = pack(&Ping { time: sent }, &sender).unwrap();
    write_half.write_all(&ping).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(a.connection_addrs("pinger").is_some());

    // unconfigured peers are not in the node report, only in the state dump
    while a_events.log.try_recv().is_ok() {}
    a.state_dump();
    let mut dump = Vec::new();
    while let Ok(line) = a_events.log.try_recv() {
        dump.push(line);
    }
    let line = dump
        .iter()
        .find(|line| line.starts_with("[node-a] connected node: pinger"))
        .expect("pinger should be in the state dump");
    let lag: i64 = line
        .trim_end_matches(" ms")
        .rsplit(' ')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    assert!(lag >= 250, "lag was {} ms", lag);
    assert!(line.contains("packets 1"), "{}", line);

    drop(write_half);
    a.shutdown().await;
}

#[tokio::test]
async fn test_quorum_follows_joins_and_leaves() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    assert!(recv(&mut a_events.quorum_state).await);

    let b_addr = free_addr();
    let c_addr = free_addr();
    a.add_peer("node-b", b_addr.to_string());
    a.add_peer("node-c", c_addr.to_string());
    recv_until(&mut a_events.quorum_state, false).await;
    assert!(!a.quorum());

    let (b, _b_events) = manager("node-b", SECRET);
    b.add_peer("node-a", a_addr.to_string());
    b.listen_and_serve(&b_addr.to_string()).await.unwrap();

    assert_eq!(recv(&mut a_events.node_join).await, NodeName::from("node-b"));
    recv_until(&mut a_events.quorum_state, true).await;

    b.shutdown().await;
    assert_eq!(recv(&mut a_events.node_leave).await, NodeName::from("node-b"));
    recv_until(&mut a_events.quorum_state, false).await;
    assert!(!a.quorum());

    a.shutdown().await;
}

#[tokio::test]
async fn test_simultaneous_dials_converge_on_one_connection() {
    let (a, mut a_events) = manager("node-a", SECRET);
    let (b, mut b_events) = manager("node-b", SECRET);
    let a_addr = free_addr();
    let b_addr = free_addr();
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());

    // both start dialing at once
    let a_addr_str = a_addr.to_string();
    let b_addr_str = b_addr.to_string();
    let (a_bound, b_bound) = tokio::join!(
        a.listen_and_serve(&a_addr_str),
        b.listen_and_serve(&b_addr_str)
    );
    a_bound.unwrap();
    b_bound.unwrap();

    recv(&mut a_events.node_join).await;
    recv(&mut b_events.node_join).await;

    timeout(WAIT, async {
        loop {
            let on_a = a.connection_addrs("node-b");
            let on_b = b.connection_addrs("node-a");
            if let (Some((a_local, a_remote)), Some((b_local, b_remote))) = (on_a, on_b) {
                if a_local == b_remote && a_remote == b_local {
                    return;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("both nodes should agree on the surviving connection");

    assert_eq!(a.connected_peers(), vec![NodeName::from("node-b")]);
    assert_eq!(b.connected_peers(), vec![NodeName::from("node-a")]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_peer_shutdown_is_noticed_before_read_timeout() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    // long read timeout so only the notice can explain a quick leave
    let mut slow = fast_settings();
    slow.read_timeout = Duration::from_secs(30);
    a.update_settings(slow).unwrap();

    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());
    recv(&mut a_events.node_join).await;
    recv(&mut b_events.node_join).await;
    sleep(Duration::from_millis(200)).await;
    // leaves from a replaced duplicate connection
    while a_events.node_leave.try_recv().is_ok() {}

    b.shutdown().await;
    let left = timeout(Duration::from_secs(2), a_events.node_leave.recv())
        .await
        .expect("peer should leave on shutdown notice")
        .unwrap();
    assert_eq!(left, NodeName::from("node-b"));

    a.shutdown().await;
}

#[tokio::test]
async fn test_removed_peer_is_disconnected() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());
    recv(&mut a_events.node_join).await;
    recv(&mut b_events.node_join).await;

    // stop both sides from dialing again
    b.remove_peer("node-a");
    a.remove_peer("node-b");
    recv(&mut a_events.node_leave).await;
    assert!(!a.is_configured("node-b"));
    assert!(a.quorum());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_peer_that_stops_reading_is_dropped_without_stalling_others() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    let a_log = collect_log(a_events.log);
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());
    recv_until(&mut a_events.node_join, NodeName::from("node-b")).await;
    recv(&mut b_events.node_join).await;
    sleep(Duration::from_millis(200)).await;

    // node-b keeps draining what node-a sends
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let mut b_from_cluster = b_events.from_cluster;
    tokio::spawn(async move {
        while b_from_cluster.recv().await.is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    // authenticates and keeps pinging so it never hits the read timeout,
    // but never reads a byte after the handshake
    let stream = TcpStream::connect(a_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let stalled = NodeName::from("stalled");
    let request = pack(
        &AuthRequest {
            key: SECRET.to_string(),
        },
        &stalled,
    )
    .unwrap();
    write_half.write_all(&request).await.unwrap();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    timeout(WAIT, reader.read_until(b'\n', &mut line))
        .await
        .unwrap()
        .unwrap();
    let pinger = tokio::spawn(async move {
        loop {
            let ping = pack(&Ping { time: Utc::now() }, &"stalled".into()).unwrap();
            if write_half.write_all(&ping).await.is_err() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    });
    recv_until(&mut a_events.node_join, stalled.clone()).await;

    let broadcaster = {
        let a = a.clone();
        tokio::spawn(async move {
            let health = BackendHealth {
                pool: "x".repeat(1024 * 1024),
                online: true,
            };
            while a.broadcast(&health).await.is_ok() {
                sleep(Duration::from_millis(50)).await;
            }
        })
    };

    recv_until(&mut a_events.node_leave, stalled.clone()).await;
    wait_until("the write timeout is logged", || {
        count_lines(&a_log, "write timed out") >= 1
    })
    .await;
    assert!(!a.connected_peers().contains(&stalled));

    // node-b is still connected and still receiving
    let before = received.load(Ordering::SeqCst);
    wait_until("node-b receives more broadcasts", || {
        received.load(Ordering::SeqCst) >= before + 3
    })
    .await;
    assert!(a.connected_peers().contains(&NodeName::from("node-b")));

    broadcaster.abort();
    pinger.abort();
    drop(reader);
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_full_from_cluster_drops_packets_but_membership_keeps_flowing() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    let a_log = collect_log(a_events.log);
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());
    recv_until(&mut a_events.node_join, NodeName::from("node-b")).await;
    recv(&mut b_events.node_join).await;
    // let duplicate connections settle so no frame is lost with one
    sleep(Duration::from_millis(200)).await;

    // nobody drains node-a's from_cluster
    let extra = 10;
    let health = BackendHealth {
        pool: "www".to_string(),
        online: true,
    };
    for _ in 0..CHANNEL_BUFFER_SIZE + extra {
        b.broadcast(&health).await.unwrap();
    }
    wait_until("overflowing packets are dropped", || {
        count_lines(&a_log, "to from_cluster, channel full") >= extra
    })
    .await;
    assert_eq!(count_lines(&a_log, "to from_cluster, channel full"), extra);

    // joins and quorum are still handled
    let (c, mut c_events, c_addr) = start("node-c").await;
    a.add_peer("node-c", c_addr.to_string());
    c.add_peer("node-a", a_addr.to_string());
    recv_until(&mut a_events.node_join, NodeName::from("node-c")).await;
    recv(&mut c_events.node_join).await;
    assert!(a.quorum());
    recv_until(&mut a_events.quorum_state, true).await;

    let mut queued = 0;
    while let Ok(packet) = a_events.from_cluster.try_recv() {
        assert_eq!(packet.name().as_str(), "node-b");
        queued += 1;
    }
    assert_eq!(queued, CHANNEL_BUFFER_SIZE);

    for manager in [a, b, c] {
        manager.shutdown().await;
    }
}

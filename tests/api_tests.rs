mod common;

use std::net::SocketAddr;

use reqwest::StatusCode;
use serde_json::Value;

use common::*;
use skein::api::{self, paths, ApiMessage, ManagerList, NodeList};
use skein::cluster::{AdminAction, AdminRequest, ClusterEvents, Manager, ManagerRegistry, NodeStatus};

/// Serve the admin API over `registry` on a loopback port
fn serve(registry: ManagerRegistry) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let server = axum::Server::from_tcp(listener)
        .unwrap()
        .serve(api::api(registry).into_make_service());
    tokio::spawn(server);
    format!("http://{}", addr)
}

async fn single_node() -> (Manager, ClusterEvents, String) {
    let (manager, events, _addr) = start("node-a").await;
    manager.add_peer("node-b", free_addr().to_string());
    let registry = ManagerRegistry::new();
    registry.add(manager.clone());
    (manager, events, serve(registry))
}

#[tokio::test]
async fn test_base_routes() {
    let (manager, _events, url) = single_node().await;
    let client = reqwest::Client::new();

    let body = client.get(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "Welcome to Skein");

    let health_url = format!("{}{}", url, paths::base::HEALTH);
    let health = client.get(&health_url).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["managers"], 1);

    // two unreachable peers: quorum is lost but the node is still up
    manager.add_peer("node-c", free_addr().to_string());
    let health = client.get(&health_url).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["without_quorum"][0], "node-a");

    let about: Value = client
        .get(format!("{}{}", url, paths::base::ABOUT))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(about["name"], "skein");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_list_managers_and_nodes() {
    let (manager, _events, url) = single_node().await;
    let client = reqwest::Client::new();

    let managers: ApiMessage<ManagerList> = client
        .get(format!("{}{}", url, paths::cluster::MANAGERS))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(managers.success);
    assert_eq!(managers.data.managers, vec!["node-a".to_string()]);

    let nodes: ApiMessage<NodeList> = client
        .get(format!("{}{}", url, paths::nodes_path("node-a")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodes.data.manager, "node-a");
    // one configured peer that is not running
    assert!(nodes.data.quorum);
    assert_eq!(nodes.data.nodes.len(), 1);
    assert_eq!(nodes.data.nodes[0].name.as_str(), "node-b");
    assert_eq!(nodes.data.nodes[0].status, NodeStatus::Offline);

    let missing = client
        .get(format!("{}{}", url, paths::nodes_path("node-x")))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let error: Value = missing.json().await.unwrap();
    assert_eq!(error["success"], false);
    assert_eq!(error["error"]["code"], 404);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_admin_requires_bearer_secret() {
    let (manager, mut events, url) = single_node().await;
    let client = reqwest::Client::new();
    let admin_url = format!("{}{}", url, paths::admin_path("node-a", "reconnect", "node-b"));

    let anonymous = client.post(&admin_url).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let wrong = client
        .post(&admin_url)
        .bearer_auth("not-the-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    assert_silent(&mut events.from_cluster_api, std::time::Duration::from_millis(200)).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_admin_rejects_unknown_action_and_node() {
    let (manager, _events, url) = single_node().await;
    let client = reqwest::Client::new();

    let bad_action = client
        .post(format!("{}{}", url, paths::admin_path("node-a", "explode", "node-b")))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(bad_action.status(), StatusCode::BAD_REQUEST);

    let unknown_node = client
        .post(format!("{}{}", url, paths::admin_path("node-a", "down", "node-x")))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_node.status(), StatusCode::NOT_FOUND);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_admin_request_is_published() {
    let (manager, mut events, url) = single_node().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}{}", url, paths::admin_path("node-a", "down", "node-b")))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let accepted: ApiMessage<AdminRequest> = response.json().await.unwrap();
    let expected = AdminRequest {
        action: AdminAction::Down,
        node: "node-b".into(),
    };
    assert_eq!(accepted.data, expected);

    assert_eq!(recv(&mut events.from_cluster_api).await, expected);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_admin_reconnect_drops_live_connection() {
    let (a, mut a_events, a_addr) = start("node-a").await;
    let (b, mut b_events, b_addr) = start("node-b").await;
    a.add_peer("node-b", b_addr.to_string());
    b.add_peer("node-a", a_addr.to_string());
    recv(&mut a_events.node_join).await;
    recv(&mut b_events.node_join).await;
    // settle duplicate connections before counting leaves
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    while a_events.node_leave.try_recv().is_ok() {}
    while a_events.node_join.try_recv().is_ok() {}

    let registry = ManagerRegistry::new();
    registry.add(a.clone());
    let url = serve(registry);

    let response = reqwest::Client::new()
        .post(format!("{}{}", url, paths::admin_path("node-a", "reconnect", "node-b")))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(recv(&mut a_events.node_leave).await.as_str(), "node-b");
    // both sides keep dialing, so the pair comes back
    assert_eq!(recv(&mut a_events.node_join).await.as_str(), "node-b");

    a.shutdown().await;
    b.shutdown().await;
}

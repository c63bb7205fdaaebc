mod common;

use std::{net::SocketAddr, time::Duration};

use common::{CountingProvider, GatedReasoner, TestApp};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use services::services::config::Config;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(app: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, token: Option<&str>) -> Socket {
    let url = match token {
        Some(token) => format!("ws://{addr}/ws?token={token}"),
        None => format!("ws://{addr}/ws"),
    };
    connect_async(url).await.unwrap().0
}

async fn send(socket: &mut Socket, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    socket.send(Message::Text(frame)).await.unwrap();
}

async fn next_event(socket: &mut Socket) -> Value {
    let read = async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str::<Value>(&text).unwrap(),
                Some(Ok(Message::Close(_))) | None => panic!("socket closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("receive failed: {e}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("no event within 5s")
}

#[tokio::test]
async fn join_is_acknowledged_and_ping_is_answered() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let addr = serve(&app).await;
    let mut socket = connect(addr, None).await;

    send(&mut socket, "joinProjectRoom", json!("room-a")).await;
    let ack = next_event(&mut socket).await;
    assert_eq!(ack["event"], "joinedRoom");
    assert!(ack["data"].as_str().unwrap().contains("room-a"));

    send(&mut socket, "ping", json!({ "n": 1 })).await;
    assert_eq!(next_event(&mut socket).await, json!({ "event": "pong", "data": { "n": 1 } }));
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing_the_socket() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let addr = serve(&app).await;
    let mut socket = connect(addr, None).await;

    send(&mut socket, "joinProjectRoom", Value::Null).await;
    send(&mut socket, "joinProjectRoom", json!(42)).await;
    send(&mut socket, "joinProjectRoom", json!("a".repeat(500))).await;
    send(&mut socket, "joinProjectRoom", json!("../etc")).await;
    send(&mut socket, "somethingElse", json!("room-a")).await;
    socket.send(Message::Text("not json".into())).await.unwrap();

    // None of the above produced a reply, so the pong comes first
    send(&mut socket, "ping", json!("still here")).await;
    assert_eq!(next_event(&mut socket).await, json!({ "event": "pong", "data": "still here" }));
}

#[tokio::test]
async fn room_members_see_task_status_updates() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let owner = Uuid::new_v4();
    let (project, task) = app.seed(owner, 1).await;
    let addr = serve(&app).await;
    let mut socket = connect(addr, None).await;

    send(&mut socket, "joinProjectRoom", json!(project.id.to_string())).await;
    assert_eq!(next_event(&mut socket).await["event"], "joinedRoom");

    app.run(task.id, owner).await;

    let mut statuses = Vec::new();
    while statuses.last().map(String::as_str) != Some("COMPLETED") {
        let event = next_event(&mut socket).await;
        if event["event"] == "taskStatusUpdate" {
            assert_eq!(event["data"]["taskId"], task.id.to_string());
            statuses.push(event["data"]["newStatus"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(statuses, vec!["IN_PROGRESS", "COMPLETED"]);
}

#[tokio::test]
async fn require_auth_refuses_anonymous_upgrades() {
    let mut config = Config::default();
    config.realtime.require_auth = true;
    let app =
        TestApp::with_config(CountingProvider::default(), GatedReasoner::open(), config).await;
    let addr = serve(&app).await;

    match connect_async(format!("ws://{addr}/ws")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

#[tokio::test]
async fn require_auth_only_joins_owned_project_rooms() {
    let mut config = Config::default();
    config.realtime.require_auth = true;
    let app =
        TestApp::with_config(CountingProvider::default(), GatedReasoner::open(), config).await;
    let owner = Uuid::new_v4();
    let (own_project, _) = app.seed(owner, 1).await;
    let (foreign_project, _) = app.seed(Uuid::new_v4(), 1).await;
    let addr = serve(&app).await;
    let mut socket = connect(addr, Some(&app.token(owner))).await;

    send(&mut socket, "joinProjectRoom", json!(foreign_project.id.to_string())).await;
    send(&mut socket, "joinProjectRoom", json!("room-a")).await;
    send(&mut socket, "ping", json!(1)).await;
    assert_eq!(next_event(&mut socket).await["event"], "pong");

    send(&mut socket, "joinProjectRoom", json!(own_project.id.to_string())).await;
    let ack = next_event(&mut socket).await;
    assert_eq!(ack["event"], "joinedRoom");
    assert!(ack["data"].as_str().unwrap().contains(&own_project.id.to_string()));
}

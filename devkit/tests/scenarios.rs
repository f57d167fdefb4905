//! End-to-end scenarios: a full agent driven over the in-memory broker and bus

use edge_agent::bootstrap::{into_config, BootstrapReply};
use edge_agent::config::Config;
use edge_agent::heartbeat::ServiceStatus;
use edge_agent::http::{build_router, AppState};
use edge_agent::router::Service;
use edge_agent::{Agent, AgentError};
use edge_agent_devkit::fixtures::config_blob;
use edge_agent_devkit::{BootstrapReplyBuilder, MockBus, MockMqttClient, StubEdgex, TestHarness};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn exec_command_publishes_output() {
    let harness = TestHarness::new().await.unwrap();
    assert_eq!(harness.send_command("R1", "exec", "echo,hello"), 1);

    let topic = harness.control_topic();
    let frame = harness
        .wait_for_frame(&topic, WAIT, |f| f.name == "echo")
        .await
        .expect("exec response");
    assert_eq!(frame.uuid, "R1");
    assert_eq!(frame.string_value, "hello\n");

    let raw: serde_json::Value =
        serde_json::from_slice(&harness.mqtt_client.find_messages_by_topic(&topic)[0].payload)
            .unwrap();
    assert_eq!(raw[0]["bn"], "R1:");
    assert!(raw[0]["t"].is_number());
    harness.shutdown().await;
}

#[tokio::test]
async fn responses_use_configured_qos_and_retain() {
    let harness = TestHarness::with_config(|c| {
        c.mqtt.qos = 1;
        c.mqtt.retain = true;
    })
    .await
    .unwrap();
    harness.send_command("Q1", "exec", "echo,kept");

    let topic = harness.control_topic();
    harness
        .wait_for_frame(&topic, WAIT, |f| f.uuid == "Q1")
        .await
        .expect("exec response");
    let published = harness.mqtt_client.find_messages_by_topic(&topic);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    assert!(published[0].retain);
    harness.shutdown().await;
}

#[tokio::test]
async fn edgex_ping_publishes_pong() {
    let harness = TestHarness::new().await.unwrap();
    harness.send_command("R2", "control", "edgex-ping");

    let frame = harness
        .wait_for_frame(&harness.control_topic(), WAIT, |f| f.name == "edgex-ping")
        .await
        .expect("ping response");
    assert_eq!(frame.uuid, "R2");
    assert_eq!(frame.string_value, "pong");
    assert_eq!(harness.edgex.calls(), vec![("ping".to_string(), Vec::<String>::new())]);
    harness.shutdown().await;
}

#[tokio::test]
async fn terminal_open_write_close() {
    let harness = TestHarness::with_config(|c| c.terminal.session_timeout = Duration::from_secs(5))
        .await
        .unwrap();
    let topic = harness.terminal_topic("T1");
    assert_eq!(topic, "channels/CTRL/messages/res/term/T1");

    harness.send_terminal("T1", "open");
    harness.send_terminal("T1", "c,ls\n");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let frame = harness
        .wait_for_frame(&topic, WAIT, |f| f.name == "term" && !f.string_value.is_empty())
        .await;
    assert!(frame.is_some());
    assert_eq!(harness.agent.terminals().len(), 1);

    harness.send_terminal("T1", "close");
    let terminals = harness.agent.terminals().clone();
    assert!(harness.wait_until(WAIT, || terminals.is_empty()).await);

    let published = harness.mqtt_client.find_messages_by_topic(&topic).len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.mqtt_client.find_messages_by_topic(&topic).len(), published);
    harness.shutdown().await;
}

#[tokio::test]
async fn idle_terminal_expires() {
    let harness = TestHarness::with_config(|c| c.terminal.session_timeout = Duration::from_secs(3))
        .await
        .unwrap();
    let terminals = harness.agent.terminals().clone();

    let opened = Instant::now();
    harness.send_terminal("T2", "open");
    assert!(harness.wait_until(WAIT, || terminals.contains("T2")).await);
    let first_pid = terminals.pid("T2");

    assert!(harness.wait_until(WAIT, || !terminals.contains("T2")).await);
    assert!(opened.elapsed() < Duration::from_millis(4500));

    harness.send_terminal("T2", "open");
    assert!(harness.wait_until(WAIT, || terminals.contains("T2")).await);
    assert_ne!(terminals.pid("T2"), first_pid);
    harness.shutdown().await;
    assert!(terminals.is_empty());
}

#[tokio::test]
async fn heartbeat_liveness() {
    let harness =
        TestHarness::with_config(|c| c.heartbeat.interval = Duration::from_millis(100))
            .await
            .unwrap();

    harness.send_heartbeat("svcA", "service").await.unwrap();
    let services = harness.agent.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "svcA");
    assert_eq!(services[0].kind, "service");
    assert_eq!(services[0].status, ServiceStatus::Online);

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(harness.agent.services()[0].status, ServiceStatus::Offline);

    harness.send_heartbeat("svcA", "service").await.unwrap();
    assert_eq!(harness.agent.services()[0].status, ServiceStatus::Online);
    harness.shutdown().await;
}

#[test]
fn bootstrap_reply_with_data_channel_first_is_swapped() {
    let reply = BootstrapReplyBuilder::new("thing-1", "thing-key")
        .channel("D", "data")
        .channel("C", "control")
        .build();
    let reply: BootstrapReply = serde_json::from_value(reply).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut base = Config::default();
    base.file = dir.path().join("config.toml").to_string_lossy().to_string();

    let (config, _) = into_config(reply, base).unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let persisted = runtime.block_on(async {
        config.save().await.unwrap();
        Config::read(&config.file).await.unwrap()
    });
    assert_eq!(persisted.channels.control, "C");
    assert_eq!(persisted.channels.data, "D");
    assert_eq!(persisted.mqtt.username, "thing-1");
    assert_eq!(persisted.mqtt.password, "thing-key");
}

#[tokio::test]
async fn service_messages_are_relayed_to_local_bus() {
    let harness = TestHarness::new().await.unwrap();
    harness
        .mqtt_client
        .simulate_incoming("channels/CTRL/messages/services/export/routes", b"{}".to_vec());
    harness
        .mqtt_client
        .simulate_incoming("channels/CTRL/messages/services/", b"{}".to_vec());

    let bus = harness.bus.clone();
    assert!(
        harness
            .wait_until(WAIT, || bus.published_subjects().contains(&"commands.export.routes".to_string()))
            .await
    );
    assert_eq!(bus.published_subjects().len(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn config_save_writes_file_and_requests_reload() {
    let harness = TestHarness::new().await.unwrap();
    let target = harness.workdir().join("export/config.toml");
    let body = format!(
        "save,export,{},{}",
        target.display(),
        config_blob("[exp]\nlog_level = \"debug\"\n")
    );
    harness.send_command("C1", "config", &body);

    let bus = harness.bus.clone();
    assert!(
        harness
            .wait_until(WAIT, || bus.published_subjects().contains(&"commands.export.config".to_string()))
            .await
    );
    let saved = std::fs::read_to_string(&target).unwrap();
    assert!(saved.contains("debug"));
    harness.shutdown().await;
}

#[tokio::test]
async fn config_view_lists_services() {
    let harness = TestHarness::new().await.unwrap();
    harness.send_heartbeat("zeta", "device").await.unwrap();
    harness.send_heartbeat("alpha", "service").await.unwrap();
    harness.send_command("V1", "service", "view");

    let frame = harness
        .wait_for_frame(&harness.control_topic(), WAIT, |f| f.name == "view")
        .await
        .expect("view response");
    let listing: serde_json::Value = serde_json::from_str(&frame.string_value).unwrap();
    assert_eq!(listing[0]["name"], "alpha");
    assert_eq!(listing[1]["name"], "zeta");
    assert_eq!(listing[1]["type"], "device");
    harness.shutdown().await;
}

#[tokio::test]
async fn failed_commands_do_not_stop_dispatch() {
    let harness = TestHarness::new().await.unwrap();
    harness.edgex.fail_with("service down");
    harness
        .mqtt_client
        .simulate_incoming("channels/CTRL/messages/req", b"not senml".to_vec());
    harness.send_command("E1", "exec", "false");
    harness.send_command("E2", "control", "edgex-ping");
    harness.send_command("E3", "reboot", "now");
    harness.send_command("R1", "exec", "echo,still alive");

    let frame = harness
        .wait_for_frame(&harness.control_topic(), WAIT, |f| f.uuid == "R1")
        .await
        .expect("dispatch continues");
    assert_eq!(frame.string_value, "still alive\n");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let uuids: Vec<String> = harness
        .mqtt_client
        .get_published_messages()
        .iter()
        .filter_map(|m| m.frame())
        .map(|f| f.uuid)
        .collect();
    assert_eq!(uuids, vec!["R1"]);
    harness.shutdown().await;
}

#[tokio::test]
async fn control_subscription_failure_is_fatal() {
    let mqtt = MockMqttClient::new();
    mqtt.fail_subscriptions();
    let mut config = Config::default();
    config.channels.control = "CTRL".to_string();
    config.channels.data = "DATA".to_string();

    let agent = Agent::new(
        Arc::new(mqtt),
        config,
        Arc::new(StubEdgex::default()),
        Arc::new(MockBus::new()),
    )
    .await
    .unwrap();
    let Err(err) = agent.start().await else {
        panic!("start should fail when the control subscription is refused");
    };
    assert!(matches!(err, AgentError::SubscribeFailed(_)));
}

#[tokio::test]
async fn add_config_persists_and_swaps() {
    let harness = TestHarness::new().await.unwrap();
    let mut updated = harness.agent.config().as_ref().clone();
    updated.channels.data = "DATA2".to_string();
    harness.agent.add_config(updated).await.unwrap();

    assert_eq!(harness.agent.config().channels.data, "DATA2");
    let persisted = Config::read(&harness.agent.config().file).await.unwrap();
    assert_eq!(persisted.channels.data, "DATA2");

    let mut invalid = harness.agent.config().as_ref().clone();
    invalid.mqtt.qos = 7;
    assert!(harness.agent.add_config(invalid).await.is_err());
    assert_eq!(harness.agent.config().mqtt.qos, 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn admin_api() {
    let harness = TestHarness::new().await.unwrap();
    let service: Arc<dyn Service> = harness.agent.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(AppState { service }))
            .await
            .unwrap()
    });
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let version: serde_json::Value = http
        .get(format!("{base}/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["service"], "edge-agent");

    let response = http
        .post(format!("{base}/exec"))
        .json(&serde_json::json!({"bn": "H1:", "n": "exec", "vs": "echo,hi"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body[0]["vs"], "hi\n");

    let response = http
        .post(format!("{base}/pub"))
        .json(&serde_json::json!({"topic": "data", "payload": "reading"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let published = harness
        .mqtt_client
        .find_messages_by_topic("channels/DATA/messages/res");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, b"reading");

    let response = http
        .post(format!("{base}/exec"))
        .json(&serde_json::json!({"n": "exec", "vs": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let config: serde_json::Value = http
        .get(format!("{base}/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["channels"]["control"], "CTRL");
    harness.shutdown().await;
}

use evcm::bridge::serve_with_store;
use evcm::config::{AppConfig, ControllerConfig, EntityConfig, GridConfig};
use evcm::persistence::MemoryStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};

fn config() -> AppConfig {
    AppConfig {
        chargers: vec![ControllerConfig {
            id: "garage".into(),
            name: "Garage".into(),
            grid: GridConfig::Single {
                net_power: "sensor.grid_net".into(),
            },
            entities: EntityConfig {
                cable: "binary_sensor.garage_cable".into(),
                charging_enable: "switch.garage_enable".into(),
                ..EntityConfig::default()
            },
            ..ControllerConfig::default()
        }],
        ..AppConfig::default()
    }
}

async fn next_of_type<R>(lines: &mut Lines<R>, kind: &str) -> Value
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("bridge output timed out")
            .unwrap()
            .expect("bridge output closed");
        let v: Value = serde_json::from_str(&line).unwrap();
        if v["type"] == kind {
            return v;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn bridge_answers_status_and_stops_on_request() {
    let (mut host_in, bridge_in) = tokio::io::duplex(64 * 1024);
    let (bridge_out, host_out) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        serve_with_store(
            &config(),
            Arc::new(MemoryStore::new()),
            BufReader::new(bridge_in),
            bridge_out,
            std::future::pending::<()>(),
        )
        .await
    });
    let mut out = BufReader::new(host_out).lines();

    host_in
        .write_all(b"{\"type\":\"state\",\"entity_id\":\"binary_sensor.garage_cable\",\"state\":\"on\"}\n")
        .await
        .unwrap();
    // Status is published after the controller handled the change
    let mut status = Value::Null;
    for _ in 0..50 {
        host_in.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
        status = next_of_type(&mut out, "status").await;
        if status["chargers"][0]["cable_connected"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status["chargers"][0]["entry_id"], "garage");
    assert_eq!(status["chargers"][0]["cable_connected"], true);
    assert_eq!(status["priority"]["order"][0], "garage");

    host_in.write_all(b"not json\n").await.unwrap();
    let err = next_of_type(&mut out, "error").await;
    assert!(err["message"].as_str().unwrap().contains("Invalid bridge message"));

    host_in
        .write_all(b"{\"type\":\"command\",\"entry_id\":\"nope\",\"command\":{\"action\":\"set_auto_unlock\",\"enabled\":false}}\n")
        .await
        .unwrap();
    let err = next_of_type(&mut out, "error").await;
    assert!(err["message"].as_str().unwrap().contains("unknown charger"));

    host_in.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn bridge_emits_service_calls_for_the_host() {
    let (mut host_in, bridge_in) = tokio::io::duplex(64 * 1024);
    let (bridge_out, host_out) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        serve_with_store(
            &config(),
            Arc::new(MemoryStore::new()),
            BufReader::new(bridge_in),
            bridge_out,
            std::future::pending::<()>(),
        )
        .await
    });
    let mut out = BufReader::new(host_out).lines();

    for line in [
        r#"{"type":"state","entity_id":"switch.garage_enable","state":"off"}"#,
        r#"{"type":"state","entity_id":"sensor.grid_net","state":"6000"}"#,
        r#"{"type":"state","entity_id":"binary_sensor.garage_cable","state":"on"}"#,
    ] {
        host_in.write_all(line.as_bytes()).await.unwrap();
        host_in.write_all(b"\n").await.unwrap();
    }

    let call = loop {
        let v = next_of_type(&mut out, "call").await;
        if v["entity_id"] == "switch.garage_enable" {
            break v;
        }
    };
    assert_eq!(call["domain"], "switch");
    assert_eq!(call["service"], "turn_on");

    drop(host_in);
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

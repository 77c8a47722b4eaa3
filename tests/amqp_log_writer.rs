//! Log writer behavior against a live broker.
//!
//! These tests need a reachable RabbitMQ; point `AMQP_URI` at one and run
//! them with `cargo test -- --ignored`. The same buffering and sequencing
//! logic is covered against an in-memory sink in the unit tests.

use std::time::Duration;

use lapin::options::{BasicGetOptions, QueueDeclareOptions, QueuePurgeOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};

use kiln::{LogPart, LogWriter, LOGS_QUEUE};

fn amqp_uri() -> String {
    std::env::var("AMQP_URI").unwrap_or_else(|_| String::from("amqp://127.0.0.1:5672/%2f"))
}

async fn setup() -> (Connection, Channel) {
    let conn = Connection::connect(&amqp_uri(), ConnectionProperties::default())
        .await
        .unwrap_or_else(|err| panic!("couldn't open AMQP connection: {err}"));
    let channel = conn
        .create_channel()
        .await
        .unwrap_or_else(|err| panic!("couldn't open AMQP channel: {err}"));
    channel
        .queue_declare(
            LOGS_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap_or_else(|err| panic!("couldn't declare logs queue: {err}"));
    channel
        .queue_purge(LOGS_QUEUE, QueuePurgeOptions::default())
        .await
        .unwrap_or_else(|err| panic!("couldn't purge logs queue: {err}"));
    (conn, channel)
}

async fn next_part(channel: &Channel) -> LogPart {
    for _ in 0..50 {
        let message = channel
            .basic_get(LOGS_QUEUE, BasicGetOptions { no_ack: true })
            .await
            .unwrap_or_else(|err| panic!("basic.get failed: {err}"));
        if let Some(message) = message {
            return serde_json::from_slice(&message.delivery.data)
                .unwrap_or_else(|err| panic!("log part should decode: {err}"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("expected a log message, but there was none");
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker at AMQP_URI"]
async fn buffered_writes_arrive_as_one_part() {
    let (conn, channel) = setup().await;

    let writer = LogWriter::open(&conn, 4, "fake-uuid")
        .await
        .unwrap_or_else(|err| panic!("writer should open: {err}"));
    writer.set_max_log_length(1000).await;
    writer.set_timeout(Duration::from_secs(1)).await;

    writer
        .write(b"Hello, ")
        .await
        .unwrap_or_else(|err| panic!("write failed: {err}"));
    writer
        .write(b"world!")
        .await
        .unwrap_or_else(|err| panic!("write failed: {err}"));
    writer
        .close()
        .await
        .unwrap_or_else(|err| panic!("close failed: {err}"));

    let part = next_part(&channel).await;
    assert_eq!(
        part,
        LogPart {
            job_id: 4,
            content: String::from("Hello, world!"),
            number: 0,
            uuid: String::from("fake-uuid"),
            is_final: false,
        }
    );
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker at AMQP_URI"]
async fn closing_an_unused_writer_emits_one_final_part() {
    let (conn, channel) = setup().await;

    let writer = LogWriter::open(&conn, 4, "fake-uuid")
        .await
        .unwrap_or_else(|err| panic!("writer should open: {err}"));
    writer
        .close()
        .await
        .unwrap_or_else(|err| panic!("close failed: {err}"));

    let part = next_part(&channel).await;
    assert_eq!(
        part,
        LogPart {
            job_id: 4,
            content: String::new(),
            number: 0,
            uuid: String::from("fake-uuid"),
            is_final: true,
        }
    );
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker at AMQP_URI"]
async fn the_cap_applies_over_the_wire_too() {
    let (conn, _channel) = setup().await;

    let writer = LogWriter::open(&conn, 4, "fake-uuid")
        .await
        .unwrap_or_else(|err| panic!("writer should open: {err}"));
    writer.set_max_log_length(4).await;
    writer.set_timeout(Duration::from_secs(1)).await;

    writer
        .write(b"1234")
        .await
        .unwrap_or_else(|err| panic!("write within cap failed: {err}"));
    writer.write(b"5").await.expect_err("write past cap");
}

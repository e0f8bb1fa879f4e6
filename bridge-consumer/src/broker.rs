//! AMQP topology and wire plumbing.
//!
//! Everything that touches `lapin` lives here: connections with the broken-
//! connection sentinel, exchange/queue declaration, the consume stream, and
//! the mapping between AMQP field tables and the bridge's header model.

use bridge_common::delivery::{Delivery, HeaderValue, Headers};
use bytes::Bytes;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::BridgeError;

/// Topic exchange every service queue binds its routes on.
pub const EVENTS_EXCHANGE: &str = "events";
/// Direct exchange carrying shard-queue traffic.
pub const GROUP_EXCHANGE: &str = "consumer_group";

/// Connect to the broker. A broken connection pushes a sentinel onto the
/// application stop channel; the monitor is expected to restart the process,
/// not us.
pub async fn connect(url: &str, stop: mpsc::Sender<bool>) -> Result<Connection, lapin::Error> {
    let options = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current());

    #[cfg(unix)]
    let options = options.with_reactor(tokio_reactor_trait::Tokio);

    let connection = Connection::connect(url, options).await?;

    connection.on_error(move |err| {
        error!(error = %err, "connection broken");
        _ = stop.try_send(true);
    });

    Ok(connection)
}

pub fn exchange_kind(kind: &str) -> Result<ExchangeKind, BridgeError> {
    match kind {
        "topic" => Ok(ExchangeKind::Topic),
        "direct" => Ok(ExchangeKind::Direct),
        other => Err(BridgeError::UnsupportedExchangeKind(other.to_owned())),
    }
}

/// Open a channel and declare the exchange it will publish or consume on.
pub async fn channel(
    connection: &Connection,
    kind: ExchangeKind,
    exchange: &str,
) -> Result<Channel, lapin::Error> {
    let channel = connection.create_channel().await?;

    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: false,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await?;

    Ok(channel)
}

/// Declare and bind the queue, cap in-flight work at one delivery, and start
/// an exclusive manual-ack consumer on it.
pub async fn stream(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    routing_keys: &[String],
) -> Result<Consumer, lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: false,
                exclusive: false,
                auto_delete: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await?;

    for routing_key in routing_keys {
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: true },
                FieldTable::default(),
            )
            .await?;
    }

    // prefetch = 1 is the backpressure mechanism: one in-flight message per
    // worker channel.
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let consumer = channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;

    info!(exchange, consumer = queue, ?routing_keys, "consumer started");

    Ok(consumer)
}

pub async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), lapin::Error> {
    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await?
        .await?;

    Ok(())
}

pub async fn ack(channel: &Channel, delivery_tag: u64) -> Result<(), lapin::Error> {
    channel
        .basic_ack(delivery_tag, BasicAckOptions { multiple: true })
        .await
}

pub async fn nack_requeue(channel: &Channel, delivery_tag: u64) -> Result<(), lapin::Error> {
    channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: true,
            },
        )
        .await
}

pub async fn nack_drop(
    channel: &Channel,
    delivery_tag: u64,
    multiple: bool,
) -> Result<(), lapin::Error> {
    channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple,
                requeue: false,
            },
        )
        .await
}

/// Map a broker delivery onto the bridge's model.
pub fn from_amqp(delivery: &lapin::message::Delivery) -> Delivery {
    Delivery {
        routing_key: delivery.routing_key.to_string(),
        body: Bytes::from(delivery.data.clone()),
        headers: headers_from_table(delivery.properties.headers().as_ref()),
        redelivered: delivery.redelivered,
        delivery_tag: delivery.delivery_tag,
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.to_string()),
    }
}

/// Properties for republishing a delivery: content type plus headers.
pub fn publish_properties(content_type: Option<&str>, headers: &Headers) -> BasicProperties {
    let mut properties = BasicProperties::default().with_headers(table_from_headers(headers));

    if let Some(content_type) = content_type {
        properties = properties.with_content_type(ShortString::from(content_type.to_owned()));
    }

    properties
}

pub fn headers_from_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();

    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let mapped = match value {
            AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
            AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
            AMQPValue::LongString(s) => {
                HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::ByteArray(bytes) => HeaderValue::Bytes(bytes.as_slice().to_vec()),
            // Timestamps, decimals, nested tables: nothing downstream reads
            // them.
            _ => continue,
        };

        headers.insert(key.as_str().to_owned(), mapped);
    }

    headers
}

pub fn table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();

    for (key, value) in headers {
        let mapped = match value {
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Text(s) => AMQPValue::LongString(s.clone().into()),
            HeaderValue::Bytes(b) => AMQPValue::ByteArray(b.clone().into()),
        };

        table.insert(ShortString::from(key.clone()), mapped);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_table_round_trip() {
        let mut headers = Headers::new();
        headers.insert("X-QUEUE".to_owned(), HeaderValue::Text("group:q".to_owned()));
        headers.insert("X-ATTEMPT".to_owned(), HeaderValue::Int(3));
        headers.insert("X-REPLAY".to_owned(), HeaderValue::Bool(true));
        headers.insert("X-RAW".to_owned(), HeaderValue::Bytes(vec![1, 2, 3]));

        let round_tripped = headers_from_table(Some(&table_from_headers(&headers)));

        assert_eq!(round_tripped, headers);
    }

    #[test]
    fn missing_table_maps_to_empty_headers() {
        assert!(headers_from_table(None).is_empty());
    }

    #[test]
    fn narrow_integer_values_widen() {
        let mut table = FieldTable::default();
        table.insert("a".into(), AMQPValue::ShortShortInt(-4));
        table.insert("b".into(), AMQPValue::LongUInt(70_000));

        let headers = headers_from_table(Some(&table));

        assert_eq!(headers.get("a"), Some(&HeaderValue::Int(-4)));
        assert_eq!(headers.get("b"), Some(&HeaderValue::Int(70_000)));
    }

    #[test]
    fn unsupported_values_are_dropped() {
        let mut table = FieldTable::default();
        table.insert("keep".into(), AMQPValue::LongString("ok".into()));
        table.insert("drop".into(), AMQPValue::Timestamp(1_700_000_000));

        let headers = headers_from_table(Some(&table));

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("keep"), Some(&HeaderValue::Text("ok".to_owned())));
    }

    #[test]
    fn exchange_kinds() {
        assert!(matches!(exchange_kind("topic"), Ok(ExchangeKind::Topic)));
        assert!(matches!(exchange_kind("direct"), Ok(ExchangeKind::Direct)));
        assert!(exchange_kind("fanout").is_err());
    }
}

//! AMQP 0-9-1 broker over lapin

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use super::{Broker, Delivery, Subscription};
use crate::commands::envelope::QueueSpec;
use crate::{Error, Result};

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// Heartbeat interval requested from the broker, in seconds
const HEARTBEAT_SECS: u16 = 160;

/// Connection parameters for an AMQP broker
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub virtual_host: String,
}

impl AmqpSettings {
    /// Connection URI including credentials and heartbeat
    #[must_use]
    pub fn uri(&self) -> String {
        let vhost = if self.virtual_host == "/" {
            "%2f".to_string()
        } else {
            self.virtual_host.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{vhost}?heartbeat={HEARTBEAT_SECS}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
        )
    }
}

fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-max-length".into(), AMQPValue::LongInt(queue.max_length));
    args.insert("x-message-ttl".into(), AMQPValue::LongInt(queue.message_ttl_ms));
    args
}

async fn declare(channel: &Channel, queue: &QueueSpec) -> Result<()> {
    channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: queue.durable,
                ..QueueDeclareOptions::default()
            },
            queue_arguments(queue),
        )
        .await?;
    Ok(())
}

/// Broker reached over AMQP
///
/// Publishing reuses one lazily opened channel, dropped after any failure.
/// Each consumer gets its own connection.
pub struct AmqpBroker {
    settings: AmqpSettings,
    publisher: Mutex<Option<(Connection, Channel)>>,
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .finish_non_exhaustive()
    }
}

impl AmqpBroker {
    #[must_use]
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            settings,
            publisher: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<(Connection, Channel)> {
        let connection =
            Connection::connect(&self.settings.uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        tracing::debug!(host = %self.settings.host, port = self.settings.port, "opened amqp channel");
        Ok((connection, channel))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, queue: &QueueSpec, body: Vec<u8>) -> Result<()> {
        let mut publisher = self.publisher.lock().await;
        if publisher.as_ref().is_none_or(|(conn, _)| !conn.status().connected()) {
            *publisher = Some(self.open().await?);
        }
        let Some((_, channel)) = publisher.as_ref() else {
            return Err(Error::BrokerUnavailable("no publish channel".to_string()));
        };

        let outcome = async {
            declare(channel, queue).await?;
            channel
                .basic_publish(
                    "",
                    &queue.name,
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default().with_delivery_mode(PERSISTENT),
                )
                .await?
                .await?;
            Ok::<_, Error>(())
        }
        .await;

        if outcome.is_err() {
            *publisher = None;
        }
        outcome
    }

    async fn consume(&self, queue: &QueueSpec, prefetch: u16) -> Result<Box<dyn Subscription>> {
        let (connection, channel) = self.open().await?;
        declare(&channel, queue).await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("scp-hub-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &queue.name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(AmqpSubscription {
            connection,
            channel,
            consumer,
        }))
    }
}

struct AmqpSubscription {
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next(&mut self) -> Result<Box<dyn Delivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Box::new(AmqpDelivery(delivery))),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Channel("consumer stream closed".to_string())),
        }
    }

    async fn close(&mut self) {
        if self.channel.status().connected() {
            let _ = self.channel.close(200, "closing").await;
        }
        if self.connection.status().connected() {
            let _ = self.connection.close(200, "closing").await;
        }
    }
}

struct AmqpDelivery(lapin::message::Delivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    async fn ack(&self) -> Result<()> {
        self.0.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

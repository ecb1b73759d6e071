//! NATS JetStream client: connect, ensure stream, manage the service queue

use super::config::{NatsConfig, StartPolicy, StorageType};
use crate::connection::Connector;
use crate::error::{EventError, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Live JetStream session handed out by the persistent connection
#[derive(Clone)]
pub struct NatsChannel {
    /// NATS client connection
    pub client: async_nats::Client,

    /// JetStream context
    pub jetstream: jetstream::Context,

    /// Integration event stream
    pub stream: jetstream::stream::Stream,
}

/// Opens NATS connections and makes sure the stream exists
#[derive(Clone)]
pub struct NatsConnector {
    config: Arc<NatsConfig>,
}

impl NatsConnector {
    pub fn new(config: Arc<NatsConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Handle = NatsChannel;

    async fn connect(&self) -> Result<NatsChannel> {
        let client = build_connect_options(&self.config)
            .connect(&self.config.url)
            .await
            .map_err(|e| EventError::Connection(format!("{}: {}", self.config.url, e)))?;

        tracing::info!(url = %self.config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &self.config).await?;

        Ok(NatsChannel {
            client,
            jetstream,
            stream,
        })
    }

    fn is_open(&self, handle: &NatsChannel) -> bool {
        !matches!(
            handle.client.connection_state(),
            async_nats::connection::State::Disconnected
        )
    }

    fn endpoint(&self) -> String {
        self.config.url.clone()
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .name(config.queue_name.clone())
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        opts = opts.user_and_password(user.clone(), password.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let max_age = if config.max_age_secs > 0 {
        Duration::from_secs(config.max_age_secs)
    } else {
        Duration::ZERO
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age,
        max_bytes: config.max_bytes,
        duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| EventError::Connection(format!(
            "Failed to create/get stream '{}': {}",
            config.stream_name, e
        )))?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}

/// Durable pull consumer config for the service queue
///
/// Each bound event name becomes one filter subject. With no bindings the
/// queue filters on an idle subject so nothing is delivered.
pub(crate) fn queue_consumer_config(
    config: &NatsConfig,
    bindings: &BTreeSet<String>,
) -> jetstream::consumer::pull::Config {
    let filter_subjects = if bindings.is_empty() {
        vec![config.idle_subject()]
    } else {
        bindings.iter().map(|name| config.event_subject(name)).collect()
    };

    let deliver_policy = match config.start_policy {
        StartPolicy::New => jetstream::consumer::DeliverPolicy::New,
        StartPolicy::All => jetstream::consumer::DeliverPolicy::All,
    };

    jetstream::consumer::pull::Config {
        durable_name: Some(config.queue_name.clone()),
        filter_subjects,
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy,
        ack_wait: Duration::from_secs(config.ack_wait_secs),
        max_ack_pending: config.max_ack_pending,
        ..Default::default()
    }
}

/// Create or update the durable service queue
pub(crate) async fn apply_queue_bindings(
    channel: &NatsChannel,
    config: &NatsConfig,
    bindings: &BTreeSet<String>,
) -> Result<jetstream::consumer::PullConsumer> {
    let consumer = channel
        .stream
        .create_consumer(queue_consumer_config(config, bindings))
        .await
        .map_err(|e| EventError::Consumer(format!(
            "Failed to create/update queue '{}': {}",
            config.queue_name, e
        )))?;

    tracing::debug!(
        queue = %config.queue_name,
        bindings = ?bindings,
        "Queue bindings applied"
    );

    Ok(consumer)
}

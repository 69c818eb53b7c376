//! The retry-aware RabbitMQ consumer and its configuration.

use crate::attempt::DeliveryContext;
use crate::broker::{DelayRoute, LapinBroker};
use crate::dispatcher::Dispatcher;
use crate::dlq::DeadLetterReporter;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::retry::{RetryPolicy, RetryPolicyConfig, RetryStrategy};
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// At most one unacknowledged delivery is held at a time.
pub const PREFETCH_COUNT: u16 = 1;

/// Configuration for a `RetryConsumer`.
///
/// Use the `ConsumerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// The name of the queue to consume messages from.
    pub queue_name: String,
    /// The AMQP URL for connecting to the RabbitMQ broker.
    pub rabbitmq_url: String,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// Retry budget, backoff and strategy.
    pub retry_policy: RetryPolicyConfig,
    /// Where delayed retries are published when using `RetryStrategy::DelayedRepublish`.
    pub delay_route: DelayRoute,
    /// Deadline for a single handler call. `None` waits indefinitely.
    pub handler_timeout: Option<Duration>,
    /// Declare the queue as durable on startup. Dead-letter arguments are left
    /// to broker policies.
    pub declare_queue: bool,
}

impl ConsumerConfig {
    /// Creates a new `ConsumerConfigBuilder` to start building the consumer configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the queue to consume from.
    /// * `rabbitmq_url` - The connection URL for the RabbitMQ broker.
    pub fn builder(queue_name: String, rabbitmq_url: String) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new(queue_name, rabbitmq_url)
    }
}

/// A builder for creating `ConsumerConfig` instances.
pub struct ConsumerConfigBuilder {
    queue_name: String,
    rabbitmq_url: String,
    consumer_tag: Option<String>,
    retry_policy: Option<RetryPolicyConfig>,
    delay_route: Option<DelayRoute>,
    handler_timeout: Option<Duration>,
    declare_queue: bool,
}

impl ConsumerConfigBuilder {
    fn new(queue_name: String, rabbitmq_url: String) -> Self {
        Self {
            queue_name,
            rabbitmq_url,
            consumer_tag: None,
            retry_policy: None,
            delay_route: None,
            handler_timeout: None,
            declare_queue: true,
        }
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: String) -> Self {
        self.consumer_tag = Some(consumer_tag);
        self
    }

    /// Defaults to `RetryPolicyConfig::default()`.
    pub fn retry_policy(mut self, retry_policy: RetryPolicyConfig) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Defaults to `retry.exchange` / `retry.key`.
    pub fn delay_route(mut self, delay_route: DelayRoute) -> Self {
        self.delay_route = Some(delay_route);
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn declare_queue(mut self, declare: bool) -> Self {
        self.declare_queue = declare;
        self
    }

    /// Builds the final `ConsumerConfig`, applying defaults for any unset options.
    pub fn build(self) -> Result<ConsumerConfig, ConsumerError> {
        if self.queue_name.is_empty() {
            return Err(ConsumerError::configuration("queue name must not be empty"));
        }
        let retry_policy = self.retry_policy.unwrap_or_default();
        retry_policy.validate()?;

        let queue_name = self.queue_name;
        Ok(ConsumerConfig {
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", queue_name)),
            retry_policy,
            delay_route: self.delay_route.unwrap_or_default(),
            handler_timeout: self.handler_timeout,
            declare_queue: self.declare_queue,
            queue_name,
            rabbitmq_url: self.rabbitmq_url,
        })
    }
}

/// Consumes one queue, resolving each delivery through a [`Dispatcher`].
pub struct RetryConsumer<H: MessageHandler> {
    handler: Arc<H>,
    config: ConsumerConfig,
    reporter: DeadLetterReporter,
}

impl<H: MessageHandler + 'static> RetryConsumer<H> {
    /// Creates a new consumer that logs dead-lettered messages.
    pub fn new(handler: Arc<H>, config: ConsumerConfig) -> Self {
        Self { handler, config, reporter: DeadLetterReporter::default() }
    }

    /// Replaces the default logging alert and audit collaborators.
    pub fn with_reporter(mut self, reporter: DeadLetterReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Connects to RabbitMQ and processes deliveries until `shutdown` completes.
    ///
    /// Shutdown stops intake only: a delivery that is already being processed is
    /// resolved before the consumer is cancelled, so the grace period is bounded by
    /// the handler's latency (or `handler_timeout`). Transport errors end the loop
    /// with `Err`; the application is responsible for reconnecting.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = ()>,
    {
        log::info!(
            "Connecting to RabbitMQ and setting up consumer for queue '{}'...",
            self.config.queue_name
        );

        let connection = Connection::connect(&self.config.rabbitmq_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        self.setup_channel(&channel).await?;

        let dispatcher = Dispatcher::new(
            self.handler.clone(),
            Arc::new(LapinBroker::new(channel.clone())),
            RetryPolicy::new(self.config.retry_policy.clone())?,
        )
        .with_delay_route(self.config.delay_route.clone())
        .with_handler_timeout(self.config.handler_timeout)
        .with_reporter(self.reporter.clone());

        let mut consumer = channel
            .basic_consume(
                &self.config.queue_name,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Consumer '{}' started on queue '{}' (max retries: {}, strategy: {:?}). Waiting for messages...",
            consumer.tag().as_str(),
            self.config.queue_name,
            self.config.retry_policy.max_retries,
            self.config.retry_policy.strategy
        );

        tokio::pin!(shutdown);
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting deliveries.");
                    break;
                }
                next = consumer.next() => next,
            };

            let delivery = match next {
                Some(delivery) => delivery?,
                None => {
                    log::warn!("Consumer stream for queue '{}' ended.", self.config.queue_name);
                    break;
                }
            };

            match dispatcher.dispatch(DeliveryContext::from(&delivery)).await {
                Ok(disposition) => log::debug!("Delivery {} resolved: {:?}", delivery.delivery_tag, disposition),
                Err(e) if e.is_transport() => {
                    log::error!("Failed to resolve delivery {}: {}", delivery.delivery_tag, e);
                    return Err(e);
                }
                Err(e) => log::error!("Delivery {} resolved with error: {}", delivery.delivery_tag, e),
            }
        }

        channel
            .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
            .await?;
        channel.close(200, "consumer shutdown").await?;
        connection.close(200, "consumer shutdown").await?;
        log::info!("Consumer for queue '{}' stopped.", self.config.queue_name);
        Ok(())
    }

    /// Applies QoS, optionally declares the queue, and enables publisher confirms
    /// when delayed retries are published.
    async fn setup_channel(&self, channel: &Channel) -> Result<(), ConsumerError> {
        channel.basic_qos(PREFETCH_COUNT, BasicQosOptions::default()).await?;
        log::info!("QoS prefetch count set to {}", PREFETCH_COUNT);

        if self.config.declare_queue {
            channel
                .queue_declare(
                    &self.config.queue_name,
                    QueueDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await?;
            log::info!("Queue '{}' declared.", self.config.queue_name);
        }

        if self.config.retry_policy.strategy == RetryStrategy::DelayedRepublish {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
            log::info!("Publisher confirms enabled for delay route '{}'", self.config.delay_route);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingHandler;

    #[test]
    fn test_consumer_config_builder_defaults() {
        let queue_name = "test_queue".to_string();
        let url = "amqp://localhost".to_string();
        let config = ConsumerConfig::builder(queue_name.clone(), url.clone()).build().unwrap();

        assert_eq!(config.queue_name, queue_name);
        assert_eq!(config.rabbitmq_url, url);
        assert_eq!(config.consumer_tag, "test_queue_consumer");
        assert_eq!(config.retry_policy.max_retries, 3);
        assert_eq!(config.retry_policy.strategy, RetryStrategy::DeadLetterChain);
        assert_eq!(config.delay_route, DelayRoute::default());
        assert_eq!(config.handler_timeout, None);
        assert!(config.declare_queue);
    }

    #[test]
    fn test_consumer_config_builder_custom_values() {
        let retry_policy = RetryPolicyConfig::new(5, Duration::from_secs(1)).with_strategy(RetryStrategy::DelayedRepublish);

        let config = ConsumerConfig::builder("test_queue".to_string(), "amqp://localhost".to_string())
            .consumer_tag("custom_consumer".to_string())
            .retry_policy(retry_policy)
            .delay_route(DelayRoute::new("delay.x", "delay.k"))
            .handler_timeout(Duration::from_secs(2))
            .declare_queue(false)
            .build()
            .unwrap();

        assert_eq!(config.consumer_tag, "custom_consumer");
        assert_eq!(config.retry_policy.max_retries, 5);
        assert_eq!(config.retry_policy.strategy, RetryStrategy::DelayedRepublish);
        assert_eq!(config.delay_route.exchange, "delay.x");
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(2)));
        assert!(!config.declare_queue);
    }

    #[test]
    fn test_consumer_config_rejects_invalid_values() {
        let empty = ConsumerConfig::builder(String::new(), "amqp://localhost".to_string()).build();
        assert!(matches!(empty, Err(ConsumerError::Configuration { .. })));

        let bad_backoff = ConsumerConfig::builder("q".to_string(), "amqp://localhost".to_string())
            .retry_policy(RetryPolicyConfig::default().with_backoff_multiplier_base(0))
            .build();
        assert!(matches!(bad_backoff, Err(ConsumerError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_run_surfaces_connection_failure() {
        let config = ConsumerConfig::builder("q".to_string(), "not-a-url".to_string())
            .build()
            .unwrap();
        let consumer = RetryConsumer::new(Arc::new(CountingHandler::succeeding()), config);

        let result = consumer.run(std::future::pending()).await;
        assert!(matches!(result, Err(ConsumerError::Transport(_))));
    }
}

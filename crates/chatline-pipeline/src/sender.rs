//! Send Path
//!
//! [`MessageSender`] is what request handlers call. It assigns the message id,
//! builds the record from the request's [`SendContext`] and hands it to a
//! buffer; it never waits for the durable store.
//!
//! Routing:
//!
//! 1. If the send-path breaker admits it, try the primary buffer.
//! 2. An unavailable primary trips the breaker at once, so following sends go
//!    straight to the fallback until the cooldown elapses. The first send after
//!    that checks [`MessageBuffer::is_healthy`] and only enqueues into the
//!    primary if it answers; otherwise the breaker opens again.
//! 3. A full primary, or an open breaker, routes to the fallback buffer.
//! 4. Only when the fallback is full too does the caller see an error.

use std::sync::Arc;

use chatline_core::{BufferedMessage, IdGenerator, MessageId, SendContext};
use chatline_observability::metrics::ENQUEUE_TOTAL;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::buffer::MessageBuffer;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{BufferError, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferTier {
    Primary,
    Fallback,
}

impl BufferTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferTier::Primary => "primary",
            BufferTier::Fallback => "fallback",
        }
    }
}

/// Proof that a message was accepted for persistence
#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub tier: BufferTier,
    /// Position assigned by the accepting buffer
    pub sequence: u64,
}

pub struct MessageSender {
    ids: &'static IdGenerator,
    primary: Arc<dyn MessageBuffer>,
    fallback: Arc<dyn MessageBuffer>,
    breaker: CircuitBreaker,
}

impl MessageSender {
    pub fn new(
        ids: &'static IdGenerator,
        primary: Arc<dyn MessageBuffer>,
        fallback: Arc<dyn MessageBuffer>,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            ids,
            primary,
            fallback,
            breaker: CircuitBreaker::new("send", breaker),
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub async fn send(
        &self,
        ctx: &SendContext,
        body: impl Into<String>,
    ) -> Result<SendReceipt, SendError> {
        let id = self.ids.next_id();
        let message = BufferedMessage::new(ctx.to_record(id, body));

        if self.breaker.try_acquire() && self.primary_answers(id).await {
            match self.primary.enqueue(&message).await {
                Ok(sequence) => {
                    self.breaker.record_success();
                    count(BufferTier::Primary, "accepted");
                    return Ok(receipt(&message, BufferTier::Primary, sequence));
                }
                Err(BufferError::Full { capacity, .. }) => {
                    // Reachable, just saturated
                    self.breaker.record_success();
                    count(BufferTier::Primary, "full");
                    tracing::warn!(
                        message_id = %id,
                        capacity = capacity,
                        "Primary buffer full, using fallback"
                    );
                }
                Err(BufferError::Codec(e)) => {
                    self.breaker.release_probe();
                    count(BufferTier::Primary, "rejected");
                    return Err(SendError::Encode(e));
                }
                Err(e) => {
                    self.breaker.trip();
                    count(BufferTier::Primary, "unavailable");
                    tracing::warn!(
                        message_id = %id,
                        error = %e,
                        "Primary buffer unavailable, using fallback"
                    );
                }
            }
        }

        match self.fallback.enqueue(&message).await {
            Ok(sequence) => {
                count(BufferTier::Fallback, "accepted");
                Ok(receipt(&message, BufferTier::Fallback, sequence))
            }
            Err(BufferError::Codec(e)) => {
                count(BufferTier::Fallback, "rejected");
                Err(SendError::Encode(e))
            }
            Err(e) => {
                count(BufferTier::Fallback, "full");
                tracing::error!(
                    message_id = %id,
                    chatroom_id = ctx.chatroom_id,
                    error = %e,
                    "Fallback buffer refused message"
                );
                Err(SendError::BufferFull)
            }
        }
    }
}

impl MessageSender {
    /// Health check for the half-open trial; a closed breaker skips it
    async fn primary_answers(&self, id: MessageId) -> bool {
        if self.breaker.state() != CircuitState::HalfOpen {
            return true;
        }
        if self.primary.is_healthy().await {
            return true;
        }

        self.breaker.record_failure();
        count(BufferTier::Primary, "unavailable");
        tracing::debug!(message_id = %id, "Primary buffer still unhealthy, using fallback");
        false
    }
}

fn receipt(message: &BufferedMessage, tier: BufferTier, sequence: u64) -> SendReceipt {
    SendReceipt {
        id: message.record.id,
        created_at: message.record.created_at,
        tier,
        sequence,
    }
}

fn count(tier: BufferTier, result: &str) {
    ENQUEUE_TOTAL
        .with_label_values(&[tier.as_str(), result])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{MemoryBuffer, RawEntry};
    use async_trait::async_trait;
    use chatline_core::SenderProfile;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Primary that is always down, counting attempts
    #[derive(Default)]
    struct DownBuffer {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MessageBuffer for DownBuffer {
        fn name(&self) -> &str {
            "down"
        }

        async fn enqueue(&self, _message: &BufferedMessage) -> Result<u64, BufferError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BufferError::unavailable("down", "connection refused"))
        }

        async fn drain_up_to(&self, _max: usize) -> Result<Vec<RawEntry>, BufferError> {
            Err(BufferError::unavailable("down", "connection refused"))
        }

        async fn requeue_front(&self, _messages: Vec<BufferedMessage>) -> Result<(), BufferError> {
            Err(BufferError::unavailable("down", "connection refused"))
        }

        async fn size(&self) -> Result<u64, BufferError> {
            Err(BufferError::unavailable("down", "connection refused"))
        }

        async fn is_healthy(&self) -> bool {
            false
        }
    }

    fn ctx() -> SendContext {
        SendContext::new(
            9,
            SenderProfile {
                id: 77,
                display_name: "ana".to_string(),
            },
        )
    }

    fn breaker_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_primary_accepts() {
        let primary = Arc::new(MemoryBuffer::new("primary", 10));
        let fallback = Arc::new(MemoryBuffer::new("fallback", 10));
        let sender = MessageSender::new(
            IdGenerator::global(),
            primary.clone(),
            fallback.clone(),
            breaker_config(),
        );

        let receipt = sender.send(&ctx(), "hello").await.unwrap();
        assert_eq!(receipt.tier, BufferTier::Primary);
        assert_eq!(receipt.created_at, receipt.id.timestamp());
        assert_eq!(primary.size().await.unwrap(), 1);
        assert_eq!(fallback.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_primary_trips_breaker() {
        let primary = Arc::new(DownBuffer::default());
        let fallback = Arc::new(MemoryBuffer::new("fallback", 10));
        let sender = MessageSender::new(
            IdGenerator::global(),
            primary.clone(),
            fallback.clone(),
            breaker_config(),
        );

        for _ in 0..3 {
            let receipt = sender.send(&ctx(), "hi").await.unwrap();
            assert_eq!(receipt.tier, BufferTier::Fallback);
        }
        // Only the first send touched the primary
        assert_eq!(primary.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sender.breaker_state(), CircuitState::Open);
        assert_eq!(fallback.size().await.unwrap(), 3);
    }

    /// Primary whose health check fails while enqueues would still succeed
    struct SilentBuffer {
        inner: MemoryBuffer,
        pings: AtomicUsize,
    }

    #[async_trait]
    impl MessageBuffer for SilentBuffer {
        fn name(&self) -> &str {
            "silent"
        }

        async fn enqueue(&self, message: &BufferedMessage) -> Result<u64, BufferError> {
            self.inner.enqueue(message).await
        }

        async fn drain_up_to(&self, max: usize) -> Result<Vec<RawEntry>, BufferError> {
            self.inner.drain_up_to(max).await
        }

        async fn requeue_front(&self, messages: Vec<BufferedMessage>) -> Result<(), BufferError> {
            self.inner.requeue_front(messages).await
        }

        async fn size(&self) -> Result<u64, BufferError> {
            self.inner.size().await
        }

        async fn is_healthy(&self) -> bool {
            self.pings.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[tokio::test]
    async fn test_unhealthy_primary_is_skipped_after_cooldown() {
        let primary = Arc::new(SilentBuffer {
            inner: MemoryBuffer::new("silent", 10),
            pings: AtomicUsize::new(0),
        });
        let fallback = Arc::new(MemoryBuffer::new("fallback", 10));
        let sender = MessageSender::new(
            IdGenerator::global(),
            primary.clone(),
            fallback.clone(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(20),
                max_cooldown: Duration::from_millis(100),
            },
        );

        // A closed breaker does not ask for health
        assert_eq!(sender.send(&ctx(), "a").await.unwrap().tier, BufferTier::Primary);
        assert_eq!(primary.pings.load(Ordering::SeqCst), 0);

        sender.breaker.trip();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let receipt = sender.send(&ctx(), "b").await.unwrap();
        assert_eq!(receipt.tier, BufferTier::Fallback);
        assert_eq!(primary.pings.load(Ordering::SeqCst), 1);
        assert_eq!(primary.size().await.unwrap(), 1);
        assert_eq!(sender.breaker_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_full_primary_spills_to_fallback() {
        let primary = Arc::new(MemoryBuffer::new("primary", 1));
        let fallback = Arc::new(MemoryBuffer::new("fallback", 1));
        let sender = MessageSender::new(
            IdGenerator::global(),
            primary.clone(),
            fallback.clone(),
            breaker_config(),
        );

        assert_eq!(sender.send(&ctx(), "a").await.unwrap().tier, BufferTier::Primary);
        assert_eq!(sender.send(&ctx(), "b").await.unwrap().tier, BufferTier::Fallback);
        assert_eq!(sender.breaker_state(), CircuitState::Closed);

        let err = sender.send(&ctx(), "c").await.unwrap_err();
        assert!(matches!(err, SendError::BufferFull));
    }
}

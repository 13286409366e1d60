//! Single-owner mailbox event loop.
//!
//! The executor is one actor: every stimulus (decoded agent events, timer
//! expirations, HTTP completions, check results) is posted as a message and
//! handled to completion before the next one is dequeued. No handler ever
//! observes partial state.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for a mailbox-driven actor.
///
/// Messages are processed one at a time; the actor owns all of its mutable
/// state.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on an
    /// unrecoverable failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor name, for logging.
    pub actor_id: String,

    /// Messages handled so far.
    pub messages_processed: u64,

    /// When the last message was dequeued.
    pub last_message_at: Option<Instant>,
}

/// Errors that can stop an actor.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Unrecoverable failure; the actor stops and the process exits non-zero.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// Send a message after a delay. Timers deliver through the mailbox so
    /// their effects are serialized with everything else; they cannot be
    /// canceled, receivers fence stale ones instead.
    pub fn send_after(&self, delay: Duration, msg: M) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = handle.send(msg).await {
                debug!(error = %e, "Dropping delayed message for stopped actor");
            }
        });
    }
}

/// Receiving half of an actor mailbox, consumed by `spawn`.
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
}

impl<M: Message> Mailbox<M> {
    /// Dequeues the next message. Exposed so tests can drive an actor's
    /// handlers directly instead of spawning it.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

/// Create a mailbox pair. The handle side can be cloned freely and captured
/// by timers, I/O tasks, and callbacks before the actor starts.
pub fn channel<M: Message>(capacity: usize) -> (ActorHandle<M>, Mailbox<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ActorHandle { tx }, Mailbox { rx })
}

/// Spawn an actor on its mailbox. Resolves when the actor stops.
pub fn spawn<A: Actor>(actor: A, mailbox: Mailbox<A::Message>) -> JoinHandle<Result<(), ActorError>> {
    tokio::spawn(run_actor_loop(actor, mailbox.rx))
}

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
) -> Result<(), ActorError> {
    let mut ctx = ActorContext {
        actor_id: actor.name().to_string(),
        messages_processed: 0,
        last_message_at: None,
    };

    actor.on_start(&mut ctx).await?;
    debug!(actor_id = %ctx.actor_id, "Actor started");

    let mut result = Ok(());

    while let Some(msg) = rx.recv().await {
        ctx.messages_processed += 1;
        ctx.last_message_at = Some(Instant::now());

        match actor.handle(msg, &mut ctx).await {
            Ok(true) => {}
            Ok(false) => {
                info!(actor_id = %ctx.actor_id, "Actor requested stop");
                break;
            }
            Err(e) => {
                error!(actor_id = %ctx.actor_id, error = %e, "Actor failed");
                result = Err(e);
                break;
            }
        }
    }

    actor.on_stop(&mut ctx).await;
    info!(
        actor_id = %ctx.actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );

    result
}

/// Exponential backoff configuration for reconnection attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown {
        remaining: u32,
    }

    #[async_trait]
    impl Actor for Countdown {
        type Message = u32;

        fn name(&self) -> &str {
            "countdown"
        }

        async fn handle(&mut self, msg: u32, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            self.remaining = self.remaining.saturating_sub(msg);
            Ok(self.remaining > 0)
        }
    }

    #[tokio::test]
    async fn test_actor_stops_on_request() {
        let (handle, mailbox) = channel::<u32>(16);
        let join = spawn(Countdown { remaining: 3 }, mailbox);

        handle.send(1).await.unwrap();
        handle.send(2).await.unwrap();

        join.await.unwrap().unwrap();
        assert!(handle.try_send(1).is_err());
    }

    #[tokio::test]
    async fn test_actor_handle_send_after() {
        let (handle, mailbox) = channel::<u32>(16);
        let join = spawn(Countdown { remaining: 1 }, mailbox);

        handle.send_after(Duration::from_millis(10), 1);

        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_messages_serialized_in_order() {
        struct Collect {
            seen: Vec<u32>,
            expect: usize,
        }

        #[async_trait]
        impl Actor for Collect {
            type Message = u32;

            fn name(&self) -> &str {
                "collect"
            }

            async fn handle(
                &mut self,
                msg: u32,
                _ctx: &mut ActorContext,
            ) -> Result<bool, ActorError> {
                self.seen.push(msg);
                if self.seen.len() == self.expect {
                    assert_eq!(self.seen, (0..self.expect as u32).collect::<Vec<_>>());
                    return Ok(false);
                }
                Ok(true)
            }
        }

        let (handle, mailbox) = channel::<u32>(64);
        let join = spawn(
            Collect {
                seen: Vec::new(),
                expect: 10,
            },
            mailbox,
        );

        for i in 0..10 {
            handle.send(i).await.unwrap();
        }

        join.await.unwrap().unwrap();
    }

    #[test]
    fn test_backoff_policy_growth() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_policy_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(30), Duration::from_secs(5));
    }
}

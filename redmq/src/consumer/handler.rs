//! Message handlers

use crate::message::MessageEnvelope;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;

/// Application code run for every consumed message
///
/// Returning `Ok(())` acknowledges the message. An error, a panic or running
/// past the message's consume timeout sends it through the
/// unacknowledgement branch.
///
/// Plain async closures taking the envelope by value are handlers too:
///
/// ```rust
/// use redmq::consumer::MessageHandler;
/// use redmq::message::MessageEnvelope;
///
/// fn assert_handler<H: MessageHandler>(_: H) {}
///
/// assert_handler(|message: MessageEnvelope| async move {
///     let text: String = message.body()?;
///     println!("{}", text);
///     Ok::<_, redmq::Error>(())
/// });
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message
    async fn handle(&self, message: &MessageEnvelope) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &MessageEnvelope) -> Result<()> {
        (self)(message.clone()).await
    }
}

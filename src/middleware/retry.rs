// Retry middleware: re-invokes the downstream chain on retryable errors with
// exponential backoff, honoring provider retry-after hints, aborting at once
// on cancellation. Streams are retried only while establishing the stream;
// once chunks flow, errors are terminal.

use async_trait::async_trait;
use std::time::Duration;

use super::{Middleware, Next, RequestContext, StreamNext};
use crate::error::GatewayError;
use crate::ir::stream::ChunkStream;
use crate::ir::ChatResponse;

pub struct RetryMiddleware {
    max_attempts: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `initial * multiplier^(attempt-1)`, capped; a provider retry-after
    /// hint takes precedence.
    fn delay_for(&self, attempt: u32, err: &GatewayError) -> Duration {
        if let Some(hinted) = err.retry_after() {
            return hinted;
        }
        let backoff = self
            .initial_delay
            .mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32));
        backoff.min(self.max_delay)
    }

    async fn wait(&self, ctx: &RequestContext, delay: Duration) -> Result<(), GatewayError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(
        &self,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<ChatResponse, GatewayError> {
        let mut attempt = 1;
        loop {
            match next.run(ctx.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt, &err);
                    log::debug!(
                        "retrying request {} after {:?} (attempt {}/{}): {}",
                        ctx.request.metadata.request_id,
                        delay,
                        attempt,
                        self.max_attempts,
                        err
                    );
                    self.wait(&ctx, delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn handle_stream(
        &self,
        ctx: RequestContext,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, GatewayError> {
        let mut attempt = 1;
        loop {
            match next.run(ctx.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    self.wait(&ctx, self.delay_for(attempt, &err)).await?;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ChatRequest, FinishReason, Message, ResponseMetadata};
    use crate::middleware::UnaryHandler;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct FailsThenSucceeds {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl UnaryHandler for FailsThenSucceeds {
        async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(GatewayError::Provider {
                    provider: "mock".to_string(),
                    status: Some(500),
                    message: "transient".to_string(),
                });
            }
            Ok(ChatResponse {
                message: Message::assistant("ok"),
                finish_reason: FinishReason::Stop,
                usage: None,
                metadata: ResponseMetadata::for_request(&ctx.request),
                raw: None,
            })
        }
    }

    struct AlwaysAuthFails(AtomicU32);

    #[async_trait]
    impl UnaryHandler for AlwaysAuthFails {
        async fn call(&self, _ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Authentication {
                provider: "mock".to_string(),
                message: "bad key".to_string(),
            })
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(
            ChatRequest::new(vec![Message::user("ping")]),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn two_failures_then_success_makes_three_calls() {
        let retry = RetryMiddleware::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1));
        let terminal = FailsThenSucceeds {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let chain = Vec::new();
        let result = retry.handle(ctx(), Next::new(&chain, &terminal)).await;
        assert!(result.is_ok());
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_rethrows_the_last_error() {
        let retry = RetryMiddleware::new()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(1));
        let terminal = FailsThenSucceeds {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let chain = Vec::new();
        let err = retry
            .handle(ctx(), Next::new(&chain, &terminal))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider");
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let retry = RetryMiddleware::new().with_max_attempts(5);
        let terminal = AlwaysAuthFails(AtomicU32::new(0));
        let chain = Vec::new();
        let err = retry
            .handle(ctx(), Next::new(&chain, &terminal))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "authentication");
        assert_eq!(terminal.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryMiddleware::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_millis(300));
        let err = GatewayError::Provider {
            provider: "x".to_string(),
            status: Some(500),
            message: String::new(),
        };
        assert_eq!(retry.delay_for(1, &err), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2, &err), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3, &err), Duration::from_millis(300));
        assert_eq!(retry.delay_for(4, &err), Duration::from_millis(300));
    }

    #[test]
    fn retry_after_takes_precedence() {
        let retry = RetryMiddleware::new();
        let err = GatewayError::RateLimit {
            provider: "x".to_string(),
            message: String::new(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(retry.delay_for(1, &err), Duration::from_secs(7));
    }
}

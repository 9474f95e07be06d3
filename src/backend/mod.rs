// Concrete provider backends. Each owns a reqwest client, lowers IR onto its
// vendor wire via `from_ir`, raises responses back via `to_ir`, and
// translates the vendor SSE envelope into IR chunks.

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "openai")]
pub mod openai;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{classify_http, parse_retry_after, GatewayError};

/// USD prices per 1k tokens, used by `estimate_cost`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePer1K {
    pub prompt: f64,
    pub completion: f64,
}

/// Send a JSON request, racing against cancellation, and classify any
/// non-2xx status through the shared table.
pub(crate) async fn execute_json<T: DeserializeOwned>(
    builder: reqwest::RequestBuilder,
    provider: &str,
    cancel: &CancellationToken,
) -> Result<T, GatewayError> {
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        sent = builder.send() => sent?,
    };
    check_status(response, provider, cancel).await?.json::<T>().await.map_err(Into::into)
}

/// Open an SSE response, racing against cancellation.
pub(crate) async fn open_sse(
    builder: reqwest::RequestBuilder,
    provider: &str,
    cancel: &CancellationToken,
) -> Result<
    impl futures::Stream<
            Item = Result<
                eventsource_stream::Event,
                eventsource_stream::EventStreamError<reqwest::Error>,
            >,
        > + Send,
    GatewayError,
> {
    use eventsource_stream::Eventsource;
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        sent = builder.send() => sent?,
    };
    let response = check_status(response, provider, cancel).await?;
    Ok(response.bytes_stream().eventsource())
}

async fn check_status(
    response: reqwest::Response,
    provider: &str,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        text = response.text() => text.unwrap_or_default(),
    };
    Err(classify_http(provider, status.as_u16(), &body, retry_after))
}

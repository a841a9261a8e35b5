use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use waypoint_core::booking::{BookingProvider, ProviderBookingRequest, ProviderConfirmation};
use waypoint_core::domain::booking::{BookingKind, IdempotencyKey};
use waypoint_core::errors::ProviderError;

pub const HTTP_PROVIDER: &str = "http";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Books against a remote provider: `POST {base_url}/bookings/{flight|hotel}`
/// with a JSON body and the idempotency key forwarded as a header.
#[derive(Clone)]
pub struct HttpBookingProvider {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpBookingProvider {
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        }
    }

    fn endpoint(&self, kind: BookingKind) -> String {
        format!("{}/bookings/{}", self.base_url, kind.as_str())
    }

    fn transport(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Transport { provider: HTTP_PROVIDER.to_string(), message: message.into() }
    }

    fn timed_out(&self) -> ProviderError {
        ProviderError::Timeout {
            provider: HTTP_PROVIDER.to_string(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[async_trait]
impl BookingProvider for HttpBookingProvider {
    fn name(&self) -> &str {
        HTTP_PROVIDER
    }

    async fn book(
        &self,
        request: &ProviderBookingRequest,
        key: &IdempotencyKey,
    ) -> Result<ProviderConfirmation, ProviderError> {
        let mut call = self
            .client
            .post(self.endpoint(request.kind))
            .timeout(self.timeout)
            .header(IDEMPOTENCY_KEY_HEADER, key.as_str())
            .json(request);
        if let Some(api_key) = &self.api_key {
            call = call.bearer_auth(api_key.expose_secret());
        }

        let response = call.send().await.map_err(|error| {
            if error.is_timeout() {
                self.timed_out()
            } else {
                self.transport(format!("booking request failed: {error}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "booking.provider.http_error",
                idempotency_key = %key,
                status = %status,
                "booking provider returned a non-success status"
            );
            // 4xx is a definitive refusal; anything else may succeed on retry.
            return Err(if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
                ProviderError::Rejected {
                    provider: HTTP_PROVIDER.to_string(),
                    message: format!("provider returned {status}: {}", body.trim()),
                }
            } else {
                self.transport(format!("provider returned {status}"))
            });
        }

        response.json::<ProviderConfirmation>().await.map_err(|error| {
            if error.is_timeout() {
                self.timed_out()
            } else {
                self.transport(format!("failed to decode provider confirmation: {error}"))
            }
        })
    }
}

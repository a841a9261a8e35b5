use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::booking::{BookingKind, IdempotencyKey};
use crate::errors::ProviderError;

pub const SANDBOX_PROVIDER: &str = "sandbox";

/// What an adapter sends to the provider. The idempotency key travels
/// separately so adapters can put it wherever their protocol expects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBookingRequest {
    pub kind: BookingKind,
    pub offer_id: String,
    pub traveler_ids: Vec<String>,
    pub request_id: Option<String>,
    pub company_id: Option<String>,
}

/// Provider identifiers, stored verbatim. At least one must be present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfirmation {
    pub external_id: Option<String>,
    pub confirmation_code: Option<String>,
}

impl ProviderConfirmation {
    pub fn has_identifier(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        present(&self.external_id) || present(&self.confirmation_code)
    }
}

#[async_trait]
pub trait BookingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Books or fails. Implementations must forward `key` so the provider can
    /// deduplicate retries on its side as well.
    async fn book(
        &self,
        request: &ProviderBookingRequest,
        key: &IdempotencyKey,
    ) -> Result<ProviderConfirmation, ProviderError>;
}

/// In-process provider for local runs and demos. Confirmations are derived
/// from the idempotency key, so a replayed key yields the same identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SandboxProvider;

#[async_trait]
impl BookingProvider for SandboxProvider {
    fn name(&self) -> &str {
        SANDBOX_PROVIDER
    }

    async fn book(
        &self,
        request: &ProviderBookingRequest,
        key: &IdempotencyKey,
    ) -> Result<ProviderConfirmation, ProviderError> {
        if request.offer_id.starts_with("unavailable") {
            return Err(ProviderError::Rejected {
                provider: SANDBOX_PROVIDER.to_string(),
                message: format!("offer `{}` is no longer available", request.offer_id),
            });
        }

        let digest = format!("{:x}", Sha256::digest(key.as_str().as_bytes()));
        let prefix = match request.kind {
            BookingKind::Flight => "SBX-FL",
            BookingKind::Hotel => "SBX-HT",
        };
        Ok(ProviderConfirmation {
            external_id: Some(format!("{prefix}-{}", &digest[..12])),
            confirmation_code: Some(digest[12..18].to_ascii_uppercase()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BookingProvider, ProviderBookingRequest, ProviderConfirmation, SandboxProvider};
    use crate::domain::booking::{BookingKind, IdempotencyKey};
    use crate::errors::ProviderError;

    fn request(offer_id: &str) -> ProviderBookingRequest {
        ProviderBookingRequest {
            kind: BookingKind::Hotel,
            offer_id: offer_id.to_string(),
            traveler_ids: vec!["T-1".to_string()],
            request_id: None,
            company_id: None,
        }
    }

    #[tokio::test]
    async fn sandbox_is_deterministic_per_key() {
        let key = IdempotencyKey::parse("bk-sandbox-1").expect("key");
        let first = SandboxProvider.book(&request("offer-1"), &key).await.expect("book");
        let second = SandboxProvider.book(&request("offer-1"), &key).await.expect("book");

        assert_eq!(first, second);
        assert!(first.external_id.as_deref().is_some_and(|id| id.starts_with("SBX-HT-")));
        assert_eq!(first.confirmation_code.as_ref().map(String::len), Some(6));
    }

    #[tokio::test]
    async fn sandbox_rejects_unavailable_offers() {
        let key = IdempotencyKey::parse("bk-sandbox-2").expect("key");
        let result = SandboxProvider.book(&request("unavailable-7"), &key).await;
        assert!(matches!(result, Err(ProviderError::Rejected { .. })));
    }

    #[test]
    fn confirmation_needs_a_non_blank_identifier() {
        assert!(!ProviderConfirmation::default().has_identifier());
        assert!(!ProviderConfirmation { external_id: Some("  ".into()), confirmation_code: None }
            .has_identifier());
        assert!(ProviderConfirmation { external_id: None, confirmation_code: Some("X1".into()) }
            .has_identifier());
    }
}

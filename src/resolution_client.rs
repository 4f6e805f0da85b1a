use crate::config::Config;
use crate::errors::{classify_status, AppError};
use crate::models::{ErrorEnvelope, ResolutionEnvelope, ResolveRequest};
use reqwest::Client;
use std::time::Duration;

/// Client for the address resolution sub-service.
///
/// The sub-service owns the ESIID database: given a full address it answers
/// with an exact-match resolution, a single candidate, or a candidate list.
/// Failures arrive either as its typed error envelope or as a bare status;
/// both are mapped to `AppError` kinds here, at the origin.
pub struct ResolutionServiceClient {
    client: Client,
    base_url: String,
}

impl ResolutionServiceClient {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| {
                AppError::ConfigurationMissing(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: config.resolution_api_base_url.clone(),
        })
    }

    /// Resolves a ZIP (optionally with a full address) to a territory.
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<ResolutionEnvelope, AppError> {
        let url = format!("{}/api/v1/resolve", self.base_url);
        tracing::info!(
            zip = %request.zip_code,
            has_address = request.address.is_some(),
            "calling resolution service"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(AppError::from)?;

        let status = response.status();
        if status.is_success() {
            let envelope: ResolutionEnvelope = response.json().await.map_err(|e| {
                AppError::ApiServerError(format!("resolution service response undecodable: {e}"))
            })?;
            tracing::info!(
                zip = %request.zip_code,
                tdsp = %envelope.resolution.tdsp.duns_id,
                method = ?envelope.resolution.method,
                "resolution service answered"
            );
            return Ok(envelope);
        }

        // The service reports failures in a typed envelope when it can.
        match response.json::<ErrorEnvelope>().await {
            Ok(envelope) => Err(envelope_to_error(status.as_u16(), envelope)),
            Err(_) => Err(classify_status(
                status.as_u16(),
                format!("resolution service returned {}", status),
            )),
        }
    }
}

/// Maps the sub-service's machine codes onto our taxonomy. Unknown codes
/// fall back to status classification.
fn envelope_to_error(status: u16, envelope: ErrorEnvelope) -> AppError {
    match envelope.code.as_str() {
        "ADDRESS_VALIDATION_FAILED" | "INVALID_ADDRESS" => {
            AppError::AddressValidationFailed(envelope.message)
        }
        "RESOLUTION_FAILED" | "NO_MATCH" => AppError::ResolutionFailed(envelope.message),
        "API_TIMEOUT" | "TIMEOUT" => AppError::ApiTimeout(envelope.message),
        "API_RATE_LIMITED" | "RATE_LIMITED" => AppError::ApiRateLimited(envelope.message),
        _ => classify_status(status, format!("{}: {}", envelope.code, envelope.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_code_mapping() {
        let err = envelope_to_error(
            422,
            ErrorEnvelope {
                code: "NO_MATCH".to_string(),
                message: "no ESIID for address".to_string(),
                user_message: None,
                retryable: false,
            },
        );
        assert!(matches!(err, AppError::ResolutionFailed(_)));

        let err = envelope_to_error(
            503,
            ErrorEnvelope {
                code: "SOMETHING_NEW".to_string(),
                message: "backend flaking".to_string(),
                user_message: None,
                retryable: true,
            },
        );
        assert!(matches!(err, AppError::ApiServerError(_)));
    }
}

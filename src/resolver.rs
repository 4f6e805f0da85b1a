//! Staged ZIP/address → territory resolution.
//!
//! Escalation per request: local reference data first (curated
//! single-territory ZIPs, split-ZIP boundary table, prefix map), then the
//! resolution sub-service for exact address matches, then the geographic
//! fallback chain when the service cannot answer. Confidence and method only
//! ever flow through [`ResolutionResult`]'s constructors, so the
//! method/confidence correlation holds on every path.

use crate::cache::TieredCache;
use crate::errors::AppError;
use crate::fallback;
use crate::models::{
    clamp_usage, Confidence, FallbackStrategy, NormalizedAddress, ResolutionEnvelope,
    ResolutionResult, ResolveRequest, SelectAlternativeRequest, SplitZipInfo, TdspCandidate,
};
use crate::resolution_client::ResolutionServiceClient;
use crate::tdsp;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Delay before the first retry of a failed sub-service call.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Validates the five-digit ZIP format shared by every entry point.
pub fn validate_zip_format(zip: &str) -> Result<(), AppError> {
    let zip_re = Regex::new(r"^\d{5}$").unwrap();
    if !zip_re.is_match(zip) {
        return Err(AppError::AddressValidationFailed(format!(
            "ZIP code {zip:?} must be exactly five digits"
        )));
    }
    Ok(())
}

/// Rejects ZIPs with no competitive market: outside the Texas band, or
/// inside it but served by a municipal utility.
pub fn ensure_deregulated(zip: &str) -> Result<(), AppError> {
    if !tdsp::in_texas_band(zip) {
        return Err(AppError::ResolutionFailed(format!(
            "ZIP {zip} is outside the Texas deregulated market"
        )));
    }
    if let Some(utility) = tdsp::municipal_utility(zip) {
        return Err(AppError::ResolutionFailed(format!(
            "ZIP {zip} is served by {utility}, which does not participate in the competitive market"
        )));
    }
    Ok(())
}

pub struct TerritoryResolver {
    service: ResolutionServiceClient,
    cache: Arc<TieredCache>,
    /// TTL for cached address resolutions; territory boundaries move rarely.
    reference_ttl: Duration,
    retry_max_attempts: u32,
}

impl TerritoryResolver {
    pub fn new(
        service: ResolutionServiceClient,
        cache: Arc<TieredCache>,
        reference_ttl: Duration,
        retry_max_attempts: u32,
    ) -> Self {
        Self {
            service,
            cache,
            reference_ttl,
            retry_max_attempts: retry_max_attempts.max(1),
        }
    }

    /// Resolves a request to a territory, escalating only as far as needed.
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<ResolutionEnvelope, AppError> {
        let zip = request.zip_code.trim();
        validate_zip_format(zip)?;
        ensure_deregulated(zip)?;

        let usage = clamp_usage(request.usage.unwrap_or(1000));

        let envelope = if let Some(raw) = &request.address {
            let address = NormalizedAddress::from_raw(raw, zip)?;
            self.resolve_address(address, zip, usage).await?
        } else {
            self.resolve_zip_only(zip, usage)?
        };

        Ok(match request.return_alternatives {
            Some(false) => ResolutionEnvelope {
                alternatives: Vec::new(),
                ..envelope
            },
            _ => envelope,
        })
    }

    /// ZIP-only analysis against local reference data. No network.
    fn resolve_zip_only(&self, zip: &str, usage: u32) -> Result<ResolutionEnvelope, AppError> {
        if let Some(t) = tdsp::single_territory_zip(zip) {
            tracing::debug!(zip, tdsp = %t.duns_id, "single-territory ZIP");
            let resolution = ResolutionResult::single_candidate(t, Confidence::High);
            return Ok(assemble(resolution, usage, None));
        }

        if let Some((info, candidates)) = tdsp::split_zip(zip) {
            tracing::info!(zip, candidates = candidates.len(), "split ZIP, address needed");
            let Some((primary, rest)) = candidates.split_first() else {
                return Err(AppError::ResolutionFailed(format!(
                    "no candidates recorded for split ZIP {zip}"
                )));
            };
            let resolution = ResolutionResult::multi_candidate(primary.clone(), rest.to_vec())
                .with_warning(
                    "This ZIP code spans multiple utility territories; provide a street \
                     address to identify the correct one.",
                );
            return Ok(assemble(resolution, usage, Some(info)));
        }

        // Not in either curated table; the prefix map still gives an
        // estimate, and the regional default covers the rest.
        let resolution = match tdsp::zip_prefix_territory(zip) {
            Some(t) => {
                ResolutionResult::heuristic(t, Confidence::Medium, FallbackStrategy::ZipPrefix)
                    .with_warning("Territory was estimated from the ZIP code prefix.")
            }
            None => {
                tracing::warn!(zip, "no ZIP mapping, using regional default");
                ResolutionResult::heuristic(
                    tdsp::regional_default(),
                    Confidence::Low,
                    FallbackStrategy::RegionalDefault,
                )
                .with_warning(
                    "No territory mapping is known for this ZIP; defaulted to the region's \
                     largest utility. Confirm with your electric bill.",
                )
            }
        };
        Ok(assemble(resolution, usage, None))
    }

    /// Address-level resolution through the sub-service, with the geographic
    /// fallback chain behind it.
    async fn resolve_address(
        &self,
        address: NormalizedAddress,
        zip: &str,
        usage: u32,
    ) -> Result<ResolutionEnvelope, AppError> {
        let key = resolution_cache_key(zip, &address);
        if let Some((mut envelope, _)) = self.cache.get::<ResolutionEnvelope>(&key).await {
            tracing::debug!(zip, "resolution cache hit");
            // The mapping is usage-independent; only the derived parameters
            // follow this caller's usage.
            envelope.api_params = envelope.resolution.api_params(usage);
            return Ok(envelope);
        }

        let request = ResolveRequest {
            address: Some(address.to_address_info()),
            zip_code: zip.to_string(),
            usage: Some(usage),
            return_alternatives: Some(true),
        };

        match self.call_with_retries(&request).await {
            Ok(envelope) => {
                self.cache
                    .set(
                        &key,
                        &envelope,
                        self.reference_ttl,
                        &[format!("territory:{}", envelope.resolution.tdsp.duns_id)],
                    )
                    .await;
                Ok(envelope)
            }
            Err(err) if fallback_eligible(&err) => {
                tracing::warn!(zip, error = %err, "service resolution failed, using geographic fallback");
                let resolution = fallback::resolve_by_fallback(zip, Some(&address.city), &err);
                let split = tdsp::split_zip(zip).map(|(info, _)| info);
                Ok(assemble(resolution, usage, split))
            }
            Err(err) => Err(err),
        }
    }

    async fn call_with_retries(
        &self,
        request: &ResolveRequest,
    ) -> Result<ResolutionEnvelope, AppError> {
        let mut delay = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.service.resolve(request).await {
                Ok(envelope) => return Ok(envelope),
                Err(err) => {
                    if err.retryable() && attempt < self.retry_max_attempts {
                        tracing::warn!(attempt, error = %err, "resolution call failed, retrying");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Applies a caller's explicit choice among a ZIP's candidates. Local
    /// reference data only; an explicit pick never claims an exact match.
    pub async fn select_alternative(
        &self,
        request: &SelectAlternativeRequest,
    ) -> Result<ResolutionEnvelope, AppError> {
        let zip = request.zip_code.trim();
        validate_zip_format(zip)?;
        ensure_deregulated(zip)?;

        let (split_info, candidates) = match tdsp::split_zip(zip) {
            Some((info, candidates)) => (Some(info), candidates),
            None => {
                let t = tdsp::single_territory_zip(zip)
                    .or_else(|| tdsp::zip_prefix_territory(zip))
                    .unwrap_or_else(tdsp::regional_default);
                (None, vec![t])
            }
        };

        let Some((primary, rest)) = candidates.split_first() else {
            return Err(AppError::ResolutionFailed(format!(
                "no candidates recorded for ZIP {zip}"
            )));
        };
        let base = ResolutionResult::multi_candidate(primary.clone(), rest.to_vec());
        let selected = base.select_alternative(&request.selected_duns).ok_or_else(|| {
            AppError::BadRequest(format!(
                "territory {} is not a candidate for ZIP {zip}",
                request.selected_duns
            ))
        })?;

        tracing::info!(zip, selected = %request.selected_duns, "caller selected territory");
        Ok(assemble(selected, 1000, split_info))
    }
}

/// Wraps a resolution into the envelope callers receive, deriving the
/// pricing parameters and the per-candidate confidence view.
fn assemble(
    resolution: ResolutionResult,
    usage: u32,
    split: Option<SplitZipInfo>,
) -> ResolutionEnvelope {
    let api_params = resolution.api_params(usage);
    let alternatives = resolution
        .alternatives
        .iter()
        .map(|t| TdspCandidate {
            tdsp: t.clone(),
            confidence: Confidence::Medium,
        })
        .collect();
    ResolutionEnvelope {
        resolution,
        alternatives,
        api_params,
        split_zip_info: split,
    }
}

/// Whether a sub-service failure may be recovered geographically.
/// Authentication and configuration problems are fatal and never masked.
fn fallback_eligible(err: &AppError) -> bool {
    !matches!(
        err,
        AppError::ApiUnauthorized(_) | AppError::ConfigurationMissing(_)
    )
}

fn resolution_cache_key(zip: &str, address: &NormalizedAddress) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.street.as_bytes());
    hasher.update(b"\0");
    hasher.update(address.unit.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"\0");
    hasher.update(address.zip4.as_deref().unwrap_or("").as_bytes());
    format!("resolve:{}:{:x}", zip, hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::ResolutionMethod;

    fn test_resolver() -> TerritoryResolver {
        let config = Config {
            database_url: "postgresql://test".to_string(),
            port: 8080,
            pricing_api_base_url: "http://127.0.0.1:9".to_string(),
            pricing_api_key: "test_key".to_string(),
            resolution_api_base_url: "http://127.0.0.1:9".to_string(),
            redis_url: None,
            plans_cache_ttl_secs: 300,
            reference_cache_ttl_secs: 86_400,
            cache_capacity: 100,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            upstream_rate_limit: 60,
            upstream_rate_window_secs: 60,
            client_rate_limit: 10,
            client_rate_window_secs: 60,
            retry_max_attempts: 2,
            http_timeout_secs: 1,
        };
        TerritoryResolver::new(
            ResolutionServiceClient::new(&config).unwrap(),
            Arc::new(TieredCache::new(100, None)),
            Duration::from_secs(60),
            config.retry_max_attempts,
        )
    }

    fn zip_request(zip: &str) -> ResolveRequest {
        ResolveRequest {
            address: None,
            zip_code: zip.to_string(),
            usage: None,
            return_alternatives: None,
        }
    }

    #[tokio::test]
    async fn test_single_territory_zip_needs_no_address() {
        let envelope = test_resolver().resolve(&zip_request("75201")).await.unwrap();
        assert_eq!(envelope.resolution.tdsp.duns_id, tdsp::ONCOR_DUNS);
        assert!(envelope.resolution.confidence >= Confidence::Medium);
        assert_eq!(envelope.resolution.method, ResolutionMethod::SingleCandidate);
        assert!(envelope.resolution.alternatives.is_empty());
        assert_eq!(envelope.api_params.tdsp_duns, tdsp::ONCOR_DUNS);
    }

    #[tokio::test]
    async fn test_split_zip_requires_disambiguation() {
        let envelope = test_resolver().resolve(&zip_request("75034")).await.unwrap();
        assert_eq!(envelope.resolution.confidence, Confidence::Low);
        assert_eq!(
            envelope.resolution.method,
            ResolutionMethod::MultiCandidateHeuristic
        );
        assert!(!envelope.resolution.alternatives.is_empty());
        assert!(!envelope.resolution.warnings.is_empty());
        let split = envelope.split_zip_info.expect("split info expected");
        assert!(split.is_known_ambiguous);
        assert!(!envelope.alternatives.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_band_zip_is_rejected() {
        let err = test_resolver().resolve(&zip_request("12345")).await.unwrap_err();
        assert!(matches!(err, AppError::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn test_malformed_zip_is_rejected() {
        for bad in ["ABCDE", "7520", "752011", "75 01"] {
            let err = test_resolver().resolve(&zip_request(bad)).await.unwrap_err();
            assert!(
                matches!(err, AppError::AddressValidationFailed(_)),
                "{bad} should fail format validation"
            );
        }
    }

    #[tokio::test]
    async fn test_municipal_zip_names_the_utility() {
        let err = test_resolver().resolve(&zip_request("78701")).await.unwrap_err();
        match err {
            AppError::ResolutionFailed(msg) => assert!(msg.contains("Austin Energy")),
            other => panic!("expected ResolutionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unmapped_zip_defaults_with_warning() {
        // 75501 (Texarkana) is in the Texas band but not in the prefix map.
        let envelope = test_resolver().resolve(&zip_request("75501")).await.unwrap();
        assert_eq!(
            envelope.resolution.fallback_strategy,
            Some(FallbackStrategy::RegionalDefault)
        );
        assert_eq!(envelope.resolution.confidence, Confidence::Low);
        assert!(!envelope.resolution.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_select_alternative_for_split_zip() {
        let request = SelectAlternativeRequest {
            zip_code: "75034".to_string(),
            selected_duns: tdsp::TNMP_DUNS.to_string(),
            address: None,
        };
        let envelope = test_resolver().select_alternative(&request).await.unwrap();
        assert_eq!(envelope.resolution.tdsp.duns_id, tdsp::TNMP_DUNS);
        assert_eq!(envelope.resolution.confidence, Confidence::Medium);
        assert_eq!(
            envelope.resolution.method,
            ResolutionMethod::MultiCandidateHeuristic
        );
        // Params and territory move together.
        assert_eq!(envelope.api_params.tdsp_duns, tdsp::TNMP_DUNS);
        // Oncor is demoted to an alternative, still selectable.
        assert!(envelope
            .resolution
            .alternatives
            .iter()
            .any(|t| t.duns_id == tdsp::ONCOR_DUNS));
    }

    #[tokio::test]
    async fn test_select_alternative_rejects_non_candidate() {
        let request = SelectAlternativeRequest {
            zip_code: "75034".to_string(),
            selected_duns: "000000000".to_string(),
            address: None,
        };
        let err = test_resolver().select_alternative(&request).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_prefix_zip_is_estimate_not_single_candidate() {
        // 75090 (Sherman) is not curated; it resolves by prefix with a warning.
        let envelope = test_resolver().resolve(&zip_request("75090")).await.unwrap();
        assert_eq!(envelope.resolution.tdsp.duns_id, tdsp::ONCOR_DUNS);
        assert_eq!(
            envelope.resolution.method,
            ResolutionMethod::MultiCandidateHeuristic
        );
        assert_eq!(
            envelope.resolution.fallback_strategy,
            Some(FallbackStrategy::ZipPrefix)
        );
        assert!(envelope.resolution.confidence <= Confidence::Medium);
    }
}

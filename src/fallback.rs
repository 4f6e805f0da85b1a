//! Geographic recovery strategies for failed territory resolutions.
//!
//! Applied in order: ZIP-prefix mapping, city-name heuristic, regional
//! default. The chain is total for ZIPs that passed the deregulated-market
//! gate, so a caller always gets a territory with warnings attached rather
//! than an opaque failure.

use crate::errors::AppError;
use crate::models::{Confidence, FallbackStrategy, ResolutionResult};
use crate::tdsp;

/// Resolves a territory without the sub-service, tagging the result with the
/// strategy that produced it. `city` should come from the normalized address
/// when one was supplied.
pub fn resolve_by_fallback(zip: &str, city: Option<&str>, origin: &AppError) -> ResolutionResult {
    let context = format!(
        "Territory service was unavailable ({}); the territory below is an estimate.",
        origin.user_message()
    );

    if let Some(tdsp) = tdsp::zip_prefix_territory(zip) {
        tracing::info!(
            zip,
            strategy = FallbackStrategy::ZipPrefix.as_str(),
            tdsp = %tdsp.duns_id,
            "fallback resolution"
        );
        return ResolutionResult::heuristic(tdsp, Confidence::Medium, FallbackStrategy::ZipPrefix)
            .with_warning(context)
            .with_warning("Territory was estimated from the ZIP code prefix.");
    }

    if let Some(tdsp) = city
        .map(|c| c.trim().to_lowercase())
        .and_then(|c| tdsp::city_territory(&c))
    {
        tracing::info!(
            zip,
            strategy = FallbackStrategy::CityHeuristic.as_str(),
            tdsp = %tdsp.duns_id,
            "fallback resolution"
        );
        return ResolutionResult::heuristic(
            tdsp,
            Confidence::Medium,
            FallbackStrategy::CityHeuristic,
        )
        .with_warning(context)
        .with_warning("Territory was estimated from the city name.");
    }

    let tdsp = tdsp::regional_default();
    tracing::warn!(
        zip,
        strategy = FallbackStrategy::RegionalDefault.as_str(),
        tdsp = %tdsp.duns_id,
        "fallback resolution exhausted geographic data, using regional default"
    );
    ResolutionResult::heuristic(tdsp, Confidence::Low, FallbackStrategy::RegionalDefault)
        .with_warning(context)
        .with_warning(
            "Territory defaulted to the region's largest utility; confirm with your electric bill.",
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolutionMethod;

    fn timeout() -> AppError {
        AppError::ApiTimeout("resolution service timed out".to_string())
    }

    #[test]
    fn test_zip_prefix_wins_when_mapped() {
        let result = resolve_by_fallback("75034", Some("Frisco"), &timeout());
        assert_eq!(result.tdsp.duns_id, tdsp::ONCOR_DUNS);
        assert_eq!(result.fallback_strategy, Some(FallbackStrategy::ZipPrefix));
        assert_eq!(result.confidence, Confidence::Medium);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_city_heuristic_when_prefix_unmapped() {
        // 78613 (Cedar Park) has no prefix mapping; the city is usable.
        let result = resolve_by_fallback("78613", Some("  CORPUS CHRISTI "), &timeout());
        assert_eq!(result.tdsp.duns_id, tdsp::AEP_CENTRAL_DUNS);
        assert_eq!(
            result.fallback_strategy,
            Some(FallbackStrategy::CityHeuristic)
        );
    }

    #[test]
    fn test_regional_default_is_last_resort() {
        let result = resolve_by_fallback("78613", Some("nowhereville"), &timeout());
        assert_eq!(result.tdsp.duns_id, tdsp::ONCOR_DUNS);
        assert_eq!(
            result.fallback_strategy,
            Some(FallbackStrategy::RegionalDefault)
        );
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_fallback_is_never_exact_match() {
        for city in [None, Some("dallas"), Some("unknown")] {
            let result = resolve_by_fallback("79999", city, &timeout());
            assert_eq!(result.method, ResolutionMethod::MultiCandidateHeuristic);
            assert!(result.confidence <= Confidence::Medium);
            assert!(result.fallback_strategy.is_some());
        }
    }
}

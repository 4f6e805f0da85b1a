use crate::config::Config;
use crate::errors::{classify_status, AppError};
use crate::models::{PlanListResponse, PlanQuery, PlanRecord};
use reqwest::Client;
use std::time::Duration;

/// Client for the upstream plan pricing API.
///
/// Failures are classified here, at the origin: transport errors become
/// timeout/network kinds via `From<reqwest::Error>`, non-2xx statuses map
/// through `classify_status`. Callers branch on the variant, never on text.
pub struct PricingApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PricingApiClient {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| {
                AppError::ConfigurationMissing(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: config.pricing_api_base_url.clone(),
            api_key: config.pricing_api_key.clone(),
        })
    }

    /// Fetches the plan list for one territory and usage benchmark.
    pub async fn fetch_plans(&self, query: &PlanQuery) -> Result<Vec<PlanRecord>, AppError> {
        let mut params: Vec<(&str, String)> = vec![
            ("key", self.api_key.clone()),
            ("tdspDuns", query.territory_id.clone()),
            ("usage", query.usage_level.to_string()),
        ];
        if let Some(term) = query.filters.term_months {
            params.push(("termMonths", term.to_string()));
        }
        if let Some(rate_type) = query.filters.rate_type {
            params.push(("rateType", rate_type.as_str().to_string()));
        }
        if let Some(green) = query.filters.min_green_energy_percent {
            params.push(("minGreenEnergy", green.to_string()));
        }

        // Build URL with proper parameter encoding.
        let url = reqwest::Url::parse_with_params(
            &format!("{}/api/v1/plans", self.base_url),
            &params,
        )
        .map_err(|e| AppError::ConfigurationMissing(format!("failed to build URL: {e}")))?;

        tracing::info!(
            territory = %query.territory_id,
            usage = query.usage_level,
            "fetching plans from pricing API"
        );
        // Redact the key from logs.
        tracing::debug!(
            "pricing API URL: {}/api/v1/plans?key=[REDACTED]&tdspDuns={}&usage={}",
            self.base_url,
            query.territory_id,
            query.usage_level
        );

        let response = self.client.get(url).send().await.map_err(AppError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "no body".to_string());
            tracing::warn!(status = %status, "pricing API returned non-success");
            return Err(classify_status(
                status.as_u16(),
                format!("pricing API returned {}: {}", status, body),
            ));
        }

        let parsed: PlanListResponse = response.json().await.map_err(|e| {
            AppError::ApiServerError(format!("pricing API response undecodable: {e}"))
        })?;

        tracing::info!(
            territory = %query.territory_id,
            plans = parsed.plans.len(),
            "plans fetched"
        );
        Ok(parsed.plans)
    }
}

use crate::errors::AppError;
use serde::{Deserialize, Serialize};

// ============ Usage Benchmarks ============

/// Standard usage benchmarks (kWh/month) the pricing API publishes rates for.
pub const USAGE_LADDER: [u32; 3] = [500, 1000, 2000];

/// Accepted range for caller-supplied usage values before clamping.
pub const USAGE_MIN: u32 = 100;
pub const USAGE_MAX: u32 = 10_000;

/// Snaps an in-range usage value onto the published benchmark ladder.
pub fn clamp_usage(usage: u32) -> u32 {
    if usage <= 750 {
        500
    } else if usage <= 1500 {
        1000
    } else {
        2000
    }
}

// ============ Plan Query ============

/// Rate structure of a retail electricity plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    /// Price per kWh fixed for the contract term.
    Fixed,
    /// Price varies month to month.
    Variable,
    /// Price indexed to a published formula or market rate.
    Indexed,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Fixed => "fixed",
            RateType::Variable => "variable",
            RateType::Indexed => "indexed",
        }
    }
}

/// Optional plan filters carried alongside a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFilters {
    /// Restrict to plans with this contract length, in months.
    pub term_months: Option<u32>,
    /// Restrict to plans with this rate structure.
    pub rate_type: Option<RateType>,
    /// Minimum renewable-content percentage.
    pub min_green_energy_percent: Option<u32>,
}

impl PlanFilters {
    pub fn is_empty(&self) -> bool {
        self.term_months.is_none()
            && self.rate_type.is_none()
            && self.min_green_energy_percent.is_none()
    }

    /// Whether a plan satisfies every set filter. Mirrors the upstream
    /// API's filter parameters so degraded (snapshot-served) results can
    /// honor the same contract locally.
    pub fn matches(&self, plan: &PlanRecord) -> bool {
        self.term_months
            .is_none_or(|term| plan.contract.term_months == term)
            && self
                .rate_type
                .is_none_or(|rate| plan.contract.rate_type == rate)
            && self
                .min_green_energy_percent
                .is_none_or(|min| plan.features.green_energy_percent >= min)
    }
}

/// Immutable query for plan records in one utility territory.
///
/// Construct via [`PlanQuery::new`], which normalizes the usage level onto
/// the benchmark ladder so equivalent queries derive equal cache keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanQuery {
    /// Utility territory identifier (DUNS number).
    pub territory_id: String,
    /// Usage benchmark in kWh, already clamped to the ladder.
    pub usage_level: u32,
    /// Optional filters.
    #[serde(default)]
    pub filters: PlanFilters,
}

impl PlanQuery {
    pub fn new(territory_id: impl Into<String>, usage_level: u32) -> Self {
        Self {
            territory_id: territory_id.into(),
            usage_level: clamp_usage(usage_level),
            filters: PlanFilters::default(),
        }
    }

    pub fn with_filters(mut self, filters: PlanFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Deterministic cache key for this query.
    ///
    /// Absent filters collapse to `-` so the key is stable regardless of how
    /// the query was built.
    pub fn cache_key(&self) -> String {
        if self.filters.is_empty() {
            return format!("plans:{}:{}", self.territory_id, self.usage_level);
        }
        format!(
            "plans:{}:{}:{}:{}:{}",
            self.territory_id,
            self.usage_level,
            self.filters
                .term_months
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.filters
                .rate_type
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.filters
                .min_green_energy_percent
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }

    /// Tag used for bulk invalidation of everything cached for a territory.
    pub fn territory_tag(&self) -> String {
        format!("territory:{}", self.territory_id)
    }
}

// ============ Plan Records ============

/// Retail provider offering a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Display name of the retail electric provider.
    pub name: String,
    /// Aggregate customer rating, 0.0 to 5.0.
    pub rating: Option<f64>,
}

/// Published rates at the standard usage benchmarks, in cents per kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingInfo {
    /// Rate at 500 kWh/month.
    pub rate_500: f64,
    /// Rate at 1000 kWh/month.
    pub rate_1000: f64,
    /// Rate at 2000 kWh/month.
    pub rate_2000: f64,
}

impl PricingInfo {
    /// Rate at the given (already clamped) benchmark.
    pub fn rate_at(&self, usage: u32) -> f64 {
        match usage {
            500 => self.rate_500,
            1000 => self.rate_1000,
            _ => self.rate_2000,
        }
    }
}

/// Contract terms of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractTerms {
    /// Contract length in months (0 for month-to-month).
    pub term_months: u32,
    /// Rate structure.
    #[serde(rename = "type")]
    pub rate_type: RateType,
    /// Fee for leaving the contract early, in dollars.
    pub early_termination_fee: f64,
}

/// Marketing/feature attributes of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFeatures {
    /// Renewable content, 0 to 100.
    pub green_energy_percent: u32,
    /// Monthly bill credit in dollars, if any.
    pub bill_credit: Option<f64>,
    /// Whether a deposit may be required.
    pub deposit_required: bool,
}

/// One electricity plan as returned by the pricing API or the snapshot store.
///
/// Immutable once returned; refreshes replace the whole record set, single
/// records are never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    /// Upstream plan identifier.
    pub id: String,
    /// Plan display name.
    pub name: String,
    /// Provider offering the plan.
    pub provider: ProviderInfo,
    /// Rates at the benchmark usages.
    pub pricing: PricingInfo,
    /// Contract terms.
    pub contract: ContractTerms,
    /// Feature attributes.
    pub features: PlanFeatures,
}

/// Envelope the upstream pricing API wraps plan lists in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanListResponse {
    pub plans: Vec<PlanRecord>,
}

/// Plan set plus provenance, as handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFetchResult {
    /// The plan records.
    pub plans: Vec<PlanRecord>,
    /// True when served from the database snapshot instead of live data.
    pub degraded: bool,
    /// Human-readable notes about how the result was produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ============ Addresses ============

/// Raw postal address as supplied by a caller. Fields may be missing or
/// unnormalized; validate via [`NormalizedAddress::from_raw`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
    /// Street line, e.g. "123 Main St".
    pub street: Option<String>,
    /// City name.
    pub city: Option<String>,
    /// Two-letter state code.
    pub state: Option<String>,
    /// Five-digit ZIP code.
    pub zip: Option<String>,
    /// ZIP+4 extension.
    pub zip4: Option<String>,
    /// Apartment/suite/unit designator.
    pub unit: Option<String>,
}

/// Validated, whitespace- and case-normalized address.
///
/// Derived once per resolution attempt and not persisted beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub zip4: Option<String>,
    pub unit: Option<String>,
}

impl NormalizedAddress {
    /// Validates a raw address against the given (already format-checked)
    /// ZIP and normalizes casing and whitespace.
    ///
    /// Street and city are required; state defaults to TX and must be TX
    /// when supplied, since territories outside Texas cannot be resolved.
    pub fn from_raw(raw: &AddressInfo, zip: &str) -> Result<Self, AppError> {
        let street = squash(raw.street.as_deref().unwrap_or(""));
        if street.is_empty() {
            return Err(AppError::AddressValidationFailed(
                "street is required for address-level resolution".to_string(),
            ));
        }
        let city = squash(raw.city.as_deref().unwrap_or(""));
        if city.is_empty() {
            return Err(AppError::AddressValidationFailed(
                "city is required for address-level resolution".to_string(),
            ));
        }
        let state = match raw.state.as_deref().map(str::trim) {
            None | Some("") => "TX".to_string(),
            Some(s) if s.eq_ignore_ascii_case("tx") => "TX".to_string(),
            Some(s) => {
                return Err(AppError::AddressValidationFailed(format!(
                    "state {s} is outside the Texas deregulated market"
                )))
            }
        };
        let zip4 = match raw.zip4.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(z) if z.len() == 4 && z.chars().all(|c| c.is_ascii_digit()) => {
                Some(z.to_string())
            }
            Some(z) => {
                return Err(AppError::AddressValidationFailed(format!(
                    "ZIP+4 extension {z} is not four digits"
                )))
            }
        };
        let unit = raw
            .unit
            .as_deref()
            .map(squash)
            .filter(|u| !u.is_empty());
        Ok(Self {
            street: street.to_uppercase(),
            city: city.to_uppercase(),
            state,
            zip: zip.to_string(),
            zip4,
            unit,
        })
    }

    /// Wire form of this address, for handing to the resolution sub-service.
    pub fn to_address_info(&self) -> AddressInfo {
        AddressInfo {
            street: Some(self.street.clone()),
            city: Some(self.city.clone()),
            state: Some(self.state.clone()),
            zip: Some(self.zip.clone()),
            zip4: self.zip4.clone(),
            unit: self.unit.clone(),
        }
    }
}

/// Trims and collapses runs of whitespace to single spaces.
fn squash(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ Territories & Resolution ============

/// A transmission/distribution utility territory. Reference data, read-only
/// at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TdspInfo {
    /// DUNS identifier used by the pricing API.
    pub duns_id: String,
    /// Utility display name.
    pub name: String,
    /// Service zone label (e.g. "North", "Coast").
    pub zone: String,
}

/// How certain a resolution result is. Ordering: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// How a resolution result was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMethod {
    /// Exact meter-identifier (ESIID) match on a full address.
    ExactMatch,
    /// Single unambiguous territory candidate for the ZIP.
    SingleCandidate,
    /// Heuristic choice among (or listing of) multiple candidates.
    MultiCandidateHeuristic,
}

impl ResolutionMethod {
    /// Highest confidence a result derived by this method may claim.
    pub fn max_confidence(&self) -> Confidence {
        match self {
            ResolutionMethod::ExactMatch => Confidence::High,
            ResolutionMethod::SingleCandidate => Confidence::High,
            ResolutionMethod::MultiCandidateHeuristic => Confidence::Medium,
        }
    }
}

/// Which recovery strategy produced a fallback result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Coarse ZIP-prefix geographic mapping.
    ZipPrefix,
    /// City-name heuristic against the normalized address.
    CityHeuristic,
    /// Dominant territory for the region, the last resort.
    RegionalDefault,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::ZipPrefix => "zip-prefix",
            FallbackStrategy::CityHeuristic => "city-heuristic",
            FallbackStrategy::RegionalDefault => "regional-default",
        }
    }
}

/// Outcome of one territory resolution attempt.
///
/// `confidence` and `method` travel together and document how the result was
/// derived; surfaces must never strip them. Built through the associated
/// constructors so the confidence/method correlation holds everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    /// The resolved territory.
    pub tdsp: TdspInfo,
    /// Certainty of the resolution.
    pub confidence: Confidence,
    /// Derivation method.
    pub method: ResolutionMethod,
    /// The normalized address the match was made against, when one was used.
    pub matched_address: Option<NormalizedAddress>,
    /// Other plausible territories, present on ambiguous results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<TdspInfo>,
    /// Recovery strategy that produced this result, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_strategy: Option<FallbackStrategy>,
    /// Degradation notices for the caller to disclose.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ResolutionResult {
    /// Exact ESIID-level match: always high confidence.
    pub fn exact_match(tdsp: TdspInfo, matched_address: NormalizedAddress) -> Self {
        Self {
            tdsp,
            confidence: Confidence::High,
            method: ResolutionMethod::ExactMatch,
            matched_address: Some(matched_address),
            alternatives: Vec::new(),
            fallback_strategy: None,
            warnings: Vec::new(),
        }
    }

    /// Single unambiguous candidate. Confidence is capped at the method's
    /// maximum and floored at medium.
    pub fn single_candidate(tdsp: TdspInfo, confidence: Confidence) -> Self {
        let confidence = confidence
            .max(Confidence::Medium)
            .min(ResolutionMethod::SingleCandidate.max_confidence());
        Self {
            tdsp,
            confidence,
            method: ResolutionMethod::SingleCandidate,
            matched_address: None,
            alternatives: Vec::new(),
            fallback_strategy: None,
            warnings: Vec::new(),
        }
    }

    /// Multiple plausible territories; caller must disambiguate.
    pub fn multi_candidate(primary: TdspInfo, alternatives: Vec<TdspInfo>) -> Self {
        Self {
            tdsp: primary,
            confidence: Confidence::Low,
            method: ResolutionMethod::MultiCandidateHeuristic,
            matched_address: None,
            alternatives,
            fallback_strategy: None,
            warnings: Vec::new(),
        }
    }

    /// Heuristic/geographic fallback result. Confidence is capped at medium.
    pub fn heuristic(tdsp: TdspInfo, confidence: Confidence, strategy: FallbackStrategy) -> Self {
        let confidence = confidence.min(ResolutionMethod::MultiCandidateHeuristic.max_confidence());
        Self {
            tdsp,
            confidence,
            method: ResolutionMethod::MultiCandidateHeuristic,
            matched_address: None,
            alternatives: Vec::new(),
            fallback_strategy: Some(strategy),
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Produces the result of a caller explicitly choosing one of the
    /// alternatives. The new result is medium confidence and keeps the
    /// multi-candidate method; an explicit pick is never an exact match.
    pub fn select_alternative(&self, duns_id: &str) -> Option<ResolutionResult> {
        let chosen = if self.tdsp.duns_id == duns_id {
            self.tdsp.clone()
        } else {
            self.alternatives
                .iter()
                .find(|t| t.duns_id == duns_id)?
                .clone()
        };
        let mut alternatives: Vec<TdspInfo> = Vec::with_capacity(self.alternatives.len());
        if self.tdsp.duns_id != chosen.duns_id {
            alternatives.push(self.tdsp.clone());
        }
        alternatives.extend(
            self.alternatives
                .iter()
                .filter(|t| t.duns_id != chosen.duns_id)
                .cloned(),
        );
        Some(ResolutionResult {
            tdsp: chosen,
            confidence: Confidence::Medium,
            method: ResolutionMethod::MultiCandidateHeuristic,
            matched_address: self.matched_address.clone(),
            alternatives,
            fallback_strategy: self.fallback_strategy,
            warnings: self.warnings.clone(),
        })
    }

    /// Pricing-API parameters derived from this resolution.
    pub fn api_params(&self, usage: u32) -> ApiParams {
        ApiParams {
            tdsp_duns: self.tdsp.duns_id.clone(),
            usage: clamp_usage(usage),
        }
    }
}

/// Split-ZIP reference data, consulted before any network call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitZipInfo {
    /// Whether the ZIP is known to span multiple territories.
    pub is_known_ambiguous: bool,
    /// Finest granularity at which the boundary is known.
    pub boundary_granularity: BoundaryGranularity,
    /// Human-readable note about the boundary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Granularity of a known territory boundary inside a split ZIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryGranularity {
    Street,
    Block,
    Zip4,
}

// ============ Resolution Sub-Service Wire Models ============

/// Request body for the resolution sub-service (and our own resolve endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Full address, when the caller has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressInfo>,
    /// Five-digit ZIP code. Required.
    pub zip_code: String,
    /// Usage benchmark for derived pricing parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<u32>,
    /// Whether candidate alternatives should be included.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_alternatives: Option<bool>,
}

/// A territory candidate with the confidence it would carry if selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TdspCandidate {
    pub tdsp: TdspInfo,
    pub confidence: Confidence,
}

/// Parameters ready to hand to the pricing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiParams {
    pub tdsp_duns: String,
    pub usage: u32,
}

/// Successful envelope from the resolution sub-service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionEnvelope {
    pub resolution: ResolutionResult,
    #[serde(default)]
    pub alternatives: Vec<TdspCandidate>,
    pub api_params: ApiParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_zip_info: Option<SplitZipInfo>,
}

/// Typed error envelope the resolution sub-service returns on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub user_message: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

/// Request to pick one of the alternatives from a prior ambiguous resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectAlternativeRequest {
    pub zip_code: String,
    /// DUNS of the chosen territory.
    pub selected_duns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressInfo>,
}

// ============ ZIP Validation Wire Models ============

/// Request body for the exposed ZIP validation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipValidationRequest {
    pub zip_code: String,
    pub city_slug: Option<String>,
    /// Client session identifier for log correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Response body for the ZIP validation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipValidationResponse {
    pub zip_code: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tdsp: Option<TdspInfo>,
    pub city_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
    pub available_plan_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

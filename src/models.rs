use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============ Provenance ============

/// How an enrichment value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceConfidence {
    /// Fetched from the external source during this run.
    Live,
    /// Cache hit within the category TTL.
    CachedFresh,
    /// Cache hit past the TTL, served because the live fetch failed.
    CachedStale,
    /// Bundled static table.
    StaticFallback,
    /// Default or correlation guess with no direct data behind it.
    Heuristic,
}

impl SourceConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceConfidence::Live => "live",
            SourceConfidence::CachedFresh => "cachedFresh",
            SourceConfidence::CachedStale => "cachedStale",
            SourceConfidence::StaticFallback => "staticFallback",
            SourceConfidence::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for SourceConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value with exactly one provenance tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub confidence: SourceConfidence,
}

impl<T> Sourced<T> {
    pub fn new(value: T, confidence: SourceConfidence) -> Self {
        Self { value, confidence }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            confidence: self.confidence,
        }
    }
}

// ============ Tiers ============

/// Outreach-priority bucket. Declaration order is best-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    S,
    AAA,
    AA,
    A,
    B,
    C,
    D,
    E,
}

impl Tier {
    pub const ALL: [Tier; 8] = [
        Tier::S,
        Tier::AAA,
        Tier::AA,
        Tier::A,
        Tier::B,
        Tier::C,
        Tier::D,
        Tier::E,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::S => "S",
            Tier::AAA => "AAA",
            Tier::AA => "AA",
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
            Tier::D => "D",
            Tier::E => "E",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Tier::S => Priority::Immediate,
            Tier::AAA => Priority::Today,
            Tier::AA => Priority::ThisWeek,
            Tier::A => Priority::Automate,
            Tier::B => Priority::Low,
            Tier::C | Tier::D | Tier::E => Priority::Archive,
        }
    }

    /// Parses a comma-separated list such as `"S,AAA"`.
    pub fn parse_list(raw: &str) -> Result<Vec<Tier>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Tier::from_str)
            .collect()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tier '{}'", s))
    }
}

/// Action priority attached to each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Immediate,
    Today,
    ThisWeek,
    Automate,
    Low,
    Archive,
}

impl Priority {
    pub fn label(&self) -> &'static str {
        match self {
            Priority::Immediate => "NATYCHMIAST",
            Priority::Today => "DZIŚ",
            Priority::ThisWeek => "TEN TYDZIEŃ",
            Priority::Automate => "AUTOMAT",
            Priority::Low => "NISKI",
            Priority::Archive => "ARCHIWUM",
        }
    }

    pub fn next_action(&self) -> &'static str {
        match self {
            Priority::Immediate => "Telefon w ciągu 24h",
            Priority::Today => "Kontakt tego dnia",
            Priority::ThisWeek => "Kontakt w tym tygodniu",
            Priority::Automate => "Sekwencja automatyczna",
            Priority::Low => "Raz w miesiącu",
            Priority::Archive => "Ignoruj",
        }
    }
}

/// Regional purchasing-power band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WealthTier {
    Premium,
    High,
    Medium,
    Standard,
    Low,
}

impl WealthTier {
    /// 9-10 Premium, 7-8 High, 5-6 Medium, 3-4 Standard, 1-2 Low.
    pub fn from_score(score: u8) -> Self {
        match score {
            9.. => WealthTier::Premium,
            7..=8 => WealthTier::High,
            5..=6 => WealthTier::Medium,
            3..=4 => WealthTier::Standard,
            _ => WealthTier::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WealthTier::Premium => "Premium",
            WealthTier::High => "High",
            WealthTier::Medium => "Medium",
            WealthTier::Standard => "Standard",
            WealthTier::Low => "Low",
        }
    }
}

impl fmt::Display for WealthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Records ============

/// One input row, cells aligned to the file's header row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based data row number (header excluded).
    pub row: usize,
    pub cells: Vec<String>,
}

/// Normalized record produced by the refinery.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CleanRecord {
    pub row: usize,
    pub tax_id: Option<String>,
    /// Identifier was present but failed the checksum.
    pub tax_id_flagged: bool,
    /// Canonical `48XXXXXXXXX` digits.
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Canonical `XX-XXX`.
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub website: Option<String>,
    pub industry_code: Option<String>,
    pub legal_form: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    /// Qualifying household/family status for the higher subsidy.
    pub family_status: bool,
}

/// Why a record was excluded from the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MissingPhone,
    InvalidPhone,
    MissingEmail,
    InvalidTaxId,
}

impl RejectionReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectionReason::MissingPhone => "missing phone",
            RejectionReason::InvalidPhone => "invalid phone",
            RejectionReason::MissingEmail => "missing email",
            RejectionReason::InvalidTaxId => "invalid tax id",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============ Enrichment ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WealthProxy {
    /// 1-10.
    pub score: u8,
    pub tier: WealthTier,
    pub resolved_city: Option<String>,
    /// Estimated square-meter price, when a market price was found.
    pub sqm_price: Option<f64>,
    /// Why this score was chosen.
    pub signal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargerProximity {
    pub distance_km: f64,
    pub station: String,
    pub power_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxBenefit {
    pub tax_rate: f64,
    pub fuel_price: f64,
    pub fuel_cost_annual: f64,
    pub electric_cost_annual: f64,
    pub operating_savings_annual: f64,
    pub tax_benefit_annual: f64,
    pub subsidy_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenewalCycle {
    /// `None` when the registration date is unknown.
    pub age_years: Option<f64>,
    pub band: String,
    /// 0.0-1.0.
    pub propensity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalMarket {
    pub voivodeship: String,
    /// Premium-brand registrations whose three-year lease ends now.
    pub premium_registrations: u64,
}

/// Everything the engine attached to one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentContext {
    pub wealth: Sourced<WealthProxy>,
    pub infrastructure: Sourced<Option<ChargerProximity>>,
    pub tax: Sourced<TaxBenefit>,
    pub renewal: Sourced<RenewalCycle>,
    pub regional: Sourced<Option<RegionalMarket>>,
}

impl EnrichmentContext {
    pub fn charger_distance_km(&self) -> Option<f64> {
        self.infrastructure.value.as_ref().map(|c| c.distance_km)
    }

    /// `(layer, confidence)` for every layer, in composition order.
    pub fn confidences(&self) -> [(&'static str, SourceConfidence); 5] {
        [
            ("wealth", self.wealth.confidence),
            ("infrastructure", self.infrastructure.confidence),
            ("tax", self.tax.confidence),
            ("renewal", self.renewal.confidence),
            ("regional", self.regional.confidence),
        ]
    }

    /// A gateway-backed layer fell back past the fresh cache, or any layer
    /// is a pure heuristic.
    pub fn is_degraded(&self) -> bool {
        let gateway_backed = [
            self.infrastructure.confidence,
            self.tax.confidence,
            self.regional.confidence,
        ];
        gateway_backed.iter().any(|c| {
            matches!(
                c,
                SourceConfidence::CachedStale | SourceConfidence::StaticFallback
            )
        }) || self
            .confidences()
            .iter()
            .any(|(_, c)| *c == SourceConfidence::Heuristic)
    }
}

// ============ Scoring ============

/// Five bounded sub-scores and their sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub industry: u8,
    pub wealth: u8,
    pub company_age: u8,
    pub infrastructure: u8,
    pub contact_quality: u8,
    pub total: u8,
    pub tier: Tier,
    /// False when the company age was unknown and left out of the sum.
    pub age_scored: bool,
}

impl ScoreBreakdown {
    pub const MAX_INDUSTRY: u8 = 30;
    pub const MAX_WEALTH: u8 = 25;
    pub const MAX_COMPANY_AGE: u8 = 20;
    pub const MAX_INFRASTRUCTURE: u8 = 15;
    pub const MAX_CONTACT_QUALITY: u8 = 10;
}

// ============ Messages ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    Generated,
    Template,
}

impl NarrativeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NarrativeSource::Generated => "generated",
            NarrativeSource::Template => "template",
        }
    }
}

/// Outreach strings for a qualifying record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Messages {
    pub sniper_hook: String,
    pub tax_weapon: String,
    pub lead_description: String,
    pub narrative: Option<String>,
    pub narrative_source: Option<NarrativeSource>,
}

/// A record as it moves through one chunk.
#[derive(Debug, Clone)]
pub struct LeadRecord {
    pub record: CleanRecord,
    pub context: EnrichmentContext,
    pub score: ScoreBreakdown,
    pub messages: Option<Messages>,
}

// ============ Output ============

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fixed output column contract. Identity/contact columns plus `Tier` and
/// `TotalScore` are always populated; the rest only for qualifying tiers.
#[derive(Debug, Clone, Serialize)]
pub struct OutputRow {
    #[serde(rename = "FirstName")]
    pub first_name: String,
    #[serde(rename = "LastName")]
    pub last_name: String,
    #[serde(rename = "CompanyName")]
    pub company_name: String,
    #[serde(rename = "TaxId")]
    pub tax_id: String,
    #[serde(rename = "TaxIdFlagged")]
    pub tax_id_flagged: bool,
    #[serde(rename = "Phone")]
    pub phone: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "City")]
    pub city: String,
    #[serde(rename = "PostalCode")]
    pub postal_code: String,
    #[serde(rename = "IndustryCode")]
    pub industry_code: String,
    #[serde(rename = "Tier")]
    pub tier: String,
    #[serde(rename = "TotalScore")]
    pub total_score: u8,
    #[serde(rename = "Priority")]
    pub priority: String,
    #[serde(rename = "NextAction")]
    pub next_action: String,
    #[serde(rename = "WealthScore")]
    pub wealth_score: Option<u8>,
    #[serde(rename = "WealthTier")]
    pub wealth_tier: Option<String>,
    #[serde(rename = "WealthSignal")]
    pub wealth_signal: Option<String>,
    #[serde(rename = "SqmPriceEstimate")]
    pub sqm_price: Option<f64>,
    #[serde(rename = "ResolvedCity")]
    pub resolved_city: Option<String>,
    #[serde(rename = "ChargerDistanceKm")]
    pub charger_distance_km: Option<f64>,
    #[serde(rename = "TaxBenefitAnnual")]
    pub tax_benefit_annual: Option<f64>,
    #[serde(rename = "SubsidyAmount")]
    pub subsidy_amount: Option<f64>,
    #[serde(rename = "OperatingSavingsAnnual")]
    pub operating_savings_annual: Option<f64>,
    #[serde(rename = "CompanyAgeYears")]
    pub company_age_years: Option<f64>,
    #[serde(rename = "RenewalBand")]
    pub renewal_band: Option<String>,
    #[serde(rename = "RenewalPropensity")]
    pub renewal_propensity: Option<f64>,
    #[serde(rename = "WealthConfidence")]
    pub wealth_confidence: Option<String>,
    #[serde(rename = "InfrastructureConfidence")]
    pub infrastructure_confidence: Option<String>,
    #[serde(rename = "TaxConfidence")]
    pub tax_confidence: Option<String>,
    #[serde(rename = "RenewalConfidence")]
    pub renewal_confidence: Option<String>,
    #[serde(rename = "RegionalConfidence")]
    pub regional_confidence: Option<String>,
    #[serde(rename = "SniperHook")]
    pub sniper_hook: Option<String>,
    #[serde(rename = "TaxWeapon")]
    pub tax_weapon: Option<String>,
    #[serde(rename = "LeadDescription")]
    pub lead_description: Option<String>,
    #[serde(rename = "Narrative")]
    pub narrative: Option<String>,
    #[serde(rename = "NarrativeSource")]
    pub narrative_source: Option<String>,
}

impl OutputRow {
    /// Header row, in serialization order.
    pub const COLUMNS: [&'static str; 36] = [
        "FirstName", "LastName", "CompanyName", "TaxId", "TaxIdFlagged", "Phone", "Email",
        "City", "PostalCode", "IndustryCode", "Tier", "TotalScore", "Priority", "NextAction",
        "WealthScore", "WealthTier", "WealthSignal", "SqmPriceEstimate", "ResolvedCity",
        "ChargerDistanceKm", "TaxBenefitAnnual", "SubsidyAmount", "OperatingSavingsAnnual",
        "CompanyAgeYears", "RenewalBand", "RenewalPropensity", "WealthConfidence",
        "InfrastructureConfidence", "TaxConfidence", "RenewalConfidence", "RegionalConfidence",
        "SniperHook", "TaxWeapon", "LeadDescription", "Narrative", "NarrativeSource",
    ];

    /// Builds the exported row. Enrichment and message columns are only
    /// filled when `qualifying` is set.
    pub fn from_lead(lead: &LeadRecord, qualifying: bool) -> Self {
        let r = &lead.record;
        let ctx = &lead.context;
        let priority = lead.score.tier.priority();
        let enrich = |f: &dyn Fn() -> Option<String>| if qualifying { f() } else { None };
        let msg = lead.messages.as_ref().filter(|_| qualifying);

        Self {
            first_name: r.first_name.clone().unwrap_or_default(),
            last_name: r.last_name.clone().unwrap_or_default(),
            company_name: r.company_name.clone().unwrap_or_default(),
            tax_id: r.tax_id.clone().unwrap_or_default(),
            tax_id_flagged: r.tax_id_flagged,
            phone: r.phone.clone().unwrap_or_default(),
            email: r.email.clone().unwrap_or_default(),
            city: r.city.clone().unwrap_or_default(),
            postal_code: r.postal_code.clone().unwrap_or_default(),
            industry_code: r.industry_code.clone().unwrap_or_default(),
            tier: lead.score.tier.to_string(),
            total_score: lead.score.total,
            priority: priority.label().to_string(),
            next_action: priority.next_action().to_string(),
            wealth_score: qualifying.then_some(ctx.wealth.value.score),
            wealth_tier: enrich(&|| Some(ctx.wealth.value.tier.to_string())),
            wealth_signal: enrich(&|| Some(ctx.wealth.value.signal.clone())),
            sqm_price: ctx.wealth.value.sqm_price.filter(|_| qualifying),
            resolved_city: enrich(&|| ctx.wealth.value.resolved_city.clone()),
            charger_distance_km: ctx.charger_distance_km().filter(|_| qualifying).map(round1),
            tax_benefit_annual: qualifying.then(|| round2(ctx.tax.value.tax_benefit_annual)),
            subsidy_amount: qualifying.then(|| round2(ctx.tax.value.subsidy_amount)),
            operating_savings_annual: qualifying
                .then(|| round2(ctx.tax.value.operating_savings_annual)),
            company_age_years: ctx.renewal.value.age_years.filter(|_| qualifying).map(round2),
            renewal_band: enrich(&|| Some(ctx.renewal.value.band.clone())),
            renewal_propensity: qualifying.then_some(ctx.renewal.value.propensity),
            wealth_confidence: enrich(&|| Some(ctx.wealth.confidence.to_string())),
            infrastructure_confidence: enrich(&|| Some(ctx.infrastructure.confidence.to_string())),
            tax_confidence: enrich(&|| Some(ctx.tax.confidence.to_string())),
            renewal_confidence: enrich(&|| Some(ctx.renewal.confidence.to_string())),
            regional_confidence: enrich(&|| Some(ctx.regional.confidence.to_string())),
            sniper_hook: msg.map(|m| m.sniper_hook.clone()),
            tax_weapon: msg.map(|m| m.tax_weapon.clone()),
            lead_description: msg.map(|m| m.lead_description.clone()),
            narrative: msg.and_then(|m| m.narrative.clone()),
            narrative_source: msg
                .and_then(|m| m.narrative_source)
                .map(|s| s.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order_is_best_first() {
        assert!(Tier::S < Tier::AAA);
        assert!(Tier::A < Tier::B);
        assert_eq!(Tier::ALL.len(), 8);
    }

    #[test]
    fn test_parse_tier_list() {
        assert_eq!(Tier::parse_list("S, aaa").unwrap(), vec![Tier::S, Tier::AAA]);
        assert!(Tier::parse_list("S,Z").is_err());
        assert!(Tier::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_wealth_tier_from_score() {
        assert_eq!(WealthTier::from_score(10), WealthTier::Premium);
        assert_eq!(WealthTier::from_score(7), WealthTier::High);
        assert_eq!(WealthTier::from_score(5), WealthTier::Medium);
        assert_eq!(WealthTier::from_score(4), WealthTier::Standard);
        assert_eq!(WealthTier::from_score(1), WealthTier::Low);
    }

    #[test]
    fn test_confidence_serializes_camel_case() {
        let json = serde_json::to_string(&SourceConfidence::CachedStale).unwrap();
        assert_eq!(json, "\"cachedStale\"");
        assert_eq!(SourceConfidence::StaticFallback.to_string(), "staticFallback");
    }
}

use crate::errors::{PipelineError, ResultExt};
use crate::models::Tier;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Bundled market data asset. Overridable at runtime via `MARKET_DATA_PATH`.
const BUNDLED_MARKET_DATA: &str = include_str!("../data/market_data.json");

/// Single versioned data asset shared read-only by every enrichment layer
/// and the scoring matrix.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketData {
    pub version: String,
    pub national_avg_sqm_price: f64,
    pub city_sqm_prices: BTreeMap<String, f64>,
    /// Keys are either `NN` or `NN-N` postal prefixes.
    pub postal_city_map: BTreeMap<String, String>,
    pub postal_coordinates: BTreeMap<String, (f64, f64)>,
    pub premium_street_keywords: Vec<String>,
    pub industry_wealth_correlation: BTreeMap<String, u8>,
    pub industry_profiles: BTreeMap<String, IndustryProfile>,
    pub default_industry_profile: IndustryProfile,
    pub legal_form_tax_rates: Vec<LegalFormRate>,
    pub default_tax_rate: f64,
    pub tier_thresholds: Vec<TierThreshold>,
    pub renewal_bands: Vec<RenewalBand>,
    pub unknown_age_propensity: f64,
    pub fast_charger_min_kw: f64,
    pub chargers: Vec<StaticCharger>,
    pub voivodeships: Vec<Voivodeship>,
    pub premium_brands: Vec<String>,
    pub tax: TaxParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndustryProfile {
    pub tier: String,
    pub points: u8,
    pub name: String,
    pub full_name: String,
    pub hook_angle: String,
    pub tax_benefit_focus: bool,
    pub tax_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegalFormRate {
    /// Upper-case substring matched against the legal form.
    pub pattern: String,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierThreshold {
    pub tier: Tier,
    pub min: u8,
    pub max: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewalBand {
    pub from_years: f64,
    /// `None` for the open-ended last band.
    pub to_years: Option<f64>,
    pub band: String,
    pub propensity: f64,
}

impl RenewalBand {
    fn contains(&self, age_years: f64) -> bool {
        age_years >= self.from_years && self.to_years.map_or(true, |to| age_years < to)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticCharger {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub power_kw: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voivodeship {
    pub prefix_from: u8,
    pub prefix_to: u8,
    /// Registry region code.
    pub code: String,
    pub name: String,
    /// Static estimate of premium registrations with leases ending now.
    pub premium_estimate: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaxParameters {
    pub ev_depreciation_limit: f64,
    pub ice_depreciation_limit: f64,
    pub subsidy_standard: f64,
    pub subsidy_family: f64,
    pub annual_km: f64,
    pub fuel_litres_per_100km: f64,
    pub electric_cost_per_100km: f64,
    pub fallback_fuel_price: f64,
}

impl MarketData {
    /// Parses the asset compiled into the binary.
    pub fn bundled() -> Result<Self, PipelineError> {
        Self::from_json(BUNDLED_MARKET_DATA).context("parsing bundled market data")
    }

    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        let data: MarketData = serde_json::from_str(raw)?;
        data.validate()?;
        Ok(data)
    }

    /// Loads the override file when given, the bundled asset otherwise.
    pub fn load(path: Option<&Path>) -> Result<Arc<Self>, PipelineError> {
        let data = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading market data {}", path.display()))?;
                Self::from_json(&raw)
                    .with_context(|| format!("parsing market data {}", path.display()))?
            }
            None => Self::bundled()?,
        };

        tracing::info!(
            "✓ Market data v{} loaded: {} cities, {} industry profiles, {} chargers",
            data.version,
            data.city_sqm_prices.len(),
            data.industry_profiles.len(),
            data.chargers.len()
        );

        Ok(Arc::new(data))
    }

    /// Structural checks: tier bands partition 0-100, renewal bands are
    /// contiguous from zero, prices and rates are sane.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.national_avg_sqm_price <= 0.0 {
            return Err(PipelineError::Configuration(
                "national_avg_sqm_price must be positive".to_string(),
            ));
        }

        let mut bands = self.tier_thresholds.clone();
        bands.sort_by_key(|t| t.min);
        let mut expected_min: u16 = 0;
        for band in &bands {
            if band.min > band.max {
                return Err(PipelineError::Configuration(format!(
                    "tier {} has min {} above max {}",
                    band.tier, band.min, band.max
                )));
            }
            if u16::from(band.min) != expected_min {
                return Err(PipelineError::Configuration(format!(
                    "tier thresholds leave a gap or overlap at score {}",
                    expected_min
                )));
            }
            expected_min = u16::from(band.max) + 1;
        }
        if expected_min != 101 {
            return Err(PipelineError::Configuration(
                "tier thresholds must cover scores 0 to 100".to_string(),
            ));
        }

        let mut expected_from = 0.0;
        for (i, band) in self.renewal_bands.iter().enumerate() {
            let last = i + 1 == self.renewal_bands.len();
            if (band.from_years - expected_from).abs() > f64::EPSILON {
                return Err(PipelineError::Configuration(format!(
                    "renewal band {} does not start at {}",
                    band.band, expected_from
                )));
            }
            if !(0.0..=1.0).contains(&band.propensity) {
                return Err(PipelineError::Configuration(format!(
                    "renewal band {} propensity out of range",
                    band.band
                )));
            }
            match (band.to_years, last) {
                (None, true) => {}
                (Some(to), false) if to > band.from_years => expected_from = to,
                _ => {
                    return Err(PipelineError::Configuration(format!(
                        "renewal band {} has an invalid upper bound",
                        band.band
                    )))
                }
            }
        }
        if self.renewal_bands.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one renewal band is required".to_string(),
            ));
        }

        let tax = &self.tax;
        if tax.fallback_fuel_price <= 0.0 || tax.annual_km < 0.0 {
            return Err(PipelineError::Configuration(
                "tax parameters must be non-negative with a positive fallback fuel price"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Exact tier lookup; the band table is a validated partition.
    pub fn tier_for_score(&self, total: u8) -> Tier {
        let total = total.min(100);
        self.tier_thresholds
            .iter()
            .find(|t| (t.min..=t.max).contains(&total))
            .map(|t| t.tier)
            .unwrap_or(Tier::E)
    }

    /// Case-insensitive city lookup. Returns the canonical city name.
    pub fn city_sqm_price(&self, city: &str) -> Option<(&str, f64)> {
        let needle = city.trim().to_lowercase();
        self.city_sqm_prices
            .iter()
            .find(|(name, _)| name.to_lowercase() == needle)
            .map(|(name, price)| (name.as_str(), *price))
    }

    /// Tries the `NN-N` prefix before the `NN` prefix.
    pub fn city_for_postal(&self, postal_code: &str) -> Option<&str> {
        postal_prefixes(postal_code)
            .into_iter()
            .find_map(|p| self.postal_city_map.get(p))
            .map(String::as_str)
    }

    pub fn coordinates_for_postal(&self, postal_code: &str) -> Option<(f64, f64)> {
        postal_prefixes(postal_code)
            .into_iter()
            .find_map(|p| self.postal_coordinates.get(p))
            .copied()
    }

    pub fn voivodeship_for_postal(&self, postal_code: &str) -> Option<&Voivodeship> {
        let prefix: u8 = postal_code.get(..2)?.parse().ok()?;
        self.voivodeships
            .iter()
            .find(|v| (v.prefix_from..=v.prefix_to).contains(&prefix))
    }

    /// First premium street keyword contained in the address.
    pub fn premium_street_keyword(&self, street: &str) -> Option<&str> {
        let haystack = street.to_lowercase();
        self.premium_street_keywords
            .iter()
            .find(|k| haystack.contains(&k.to_lowercase()))
            .map(String::as_str)
    }

    pub fn industry_profile(&self, code: Option<&str>) -> &IndustryProfile {
        code.and_then(|c| self.industry_profiles.get(c))
            .unwrap_or(&self.default_industry_profile)
    }

    pub fn industry_wealth(&self, code: &str) -> Option<u8> {
        self.industry_wealth_correlation.get(code).copied()
    }

    /// Marginal tax rate by legal form; first matching pattern wins.
    pub fn legal_form_rate(&self, legal_form: Option<&str>) -> f64 {
        let Some(form) = legal_form else {
            return self.default_tax_rate;
        };
        let form = form.to_uppercase();
        self.legal_form_tax_rates
            .iter()
            .find(|r| form.contains(&r.pattern))
            .map(|r| r.rate)
            .unwrap_or(self.default_tax_rate)
    }

    pub fn renewal_band(&self, age_years: f64) -> Option<&RenewalBand> {
        self.renewal_bands.iter().find(|b| b.contains(age_years))
    }

    /// Static directory filtered to fast stations.
    pub fn fast_chargers(&self) -> impl Iterator<Item = &StaticCharger> {
        self.chargers
            .iter()
            .filter(move |c| c.power_kw >= self.fast_charger_min_kw)
    }
}

/// `["NN-N", "NN"]` for a canonical `NN-NNN` code, `["NN"]` for shorter input.
fn postal_prefixes(postal_code: &str) -> Vec<&str> {
    let mut prefixes = Vec::with_capacity(2);
    if let Some(p) = postal_code.get(..4).filter(|p| p.as_bytes().get(2) == Some(&b'-')) {
        prefixes.push(p);
    }
    if let Some(p) = postal_code.get(..2) {
        prefixes.push(p);
    }
    prefixes
}

/// Enrichment engine: attaches an `EnrichmentContext` to each clean record.
///
/// Layers run in a fixed order and fail independently:
/// 1. Wealth proxy (city price table → street keyword → industry → default)
/// 2. Infrastructure proximity (regional memo → cache/gateway → static directory)
/// 3. Tax/subsidy benefit (fuel price via cache/gateway → static price)
/// 4. Renewal-cycle propensity (company age bands)
///
/// plus the regional registry signal used by message synthesis.
use crate::cache_store::{CacheCategory, CacheStore};
use crate::config::Config;
use crate::errors::{FetchError, PipelineError};
use crate::gateway_client::{GatewaySettings, HttpGateway};
use crate::geo;
use crate::market_data::{MarketData, TaxParameters};
use crate::models::{
    ChargerProximity, CleanRecord, EnrichmentContext, RegionalMarket, RenewalCycle,
    SourceConfidence, Sourced, TaxBenefit, WealthProxy, WealthTier,
};
use crate::services::{
    ChargerDirectoryService, ChargingStation, FuelPriceService, VehicleRegistryService,
};
use chrono::NaiveDate;
use moka::future::Cache;
use serde_json::{json, Value};
use std::sync::Arc;

/// Directory query radius around a postal region's centre.
pub const CHARGER_SEARCH_RADIUS_KM: f64 = 60.0;
/// Wealth score when nothing else is known ("Standard").
pub const DEFAULT_WEALTH_SCORE: u8 = 4;
/// Wealth score for a premium street address.
pub const PREMIUM_STREET_WEALTH_SCORE: u8 = 7;

const FUEL_PRICE_KEY: &str = "pb95";

/// External sources available to this run. `None` means disabled; the
/// corresponding layer goes straight to cache and fallback.
#[derive(Clone, Default)]
pub struct Gateways {
    pub registry: Option<VehicleRegistryService>,
    pub fuel: Option<FuelPriceService>,
    pub chargers: Option<ChargerDirectoryService>,
}

impl Gateways {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        if !config.live_data {
            tracing::info!("Live data disabled, enrichment uses cache and static data only");
            return Ok(Self::disabled());
        }

        let settings = GatewaySettings::from(config);
        let registry = VehicleRegistryService::new(
            HttpGateway::new("registry", &config.registry_base_url, settings.clone())?,
            config.registry_page_size,
            config.registry_max_pages,
        );
        let chargers = ChargerDirectoryService::new(
            HttpGateway::new("charger_directory", &config.charger_base_url, settings.clone())?,
            config.charger_api_key.clone(),
        );
        let fuel = match &config.fuel_price_url {
            Some(url) => Some(FuelPriceService::new(HttpGateway::new(
                "fuel_price",
                url,
                settings,
            )?)),
            None => {
                tracing::warn!("⚠️ FUEL_PRICE_URL not set, fuel price gateway disabled");
                None
            }
        };

        tracing::info!("✓ External gateways configured");
        Ok(Self {
            registry: Some(registry),
            fuel,
            chargers: Some(chargers),
        })
    }
}

pub struct EnrichmentEngine {
    market: Arc<MarketData>,
    cache: CacheStore,
    gateways: Gateways,
    force_refresh: bool,
    as_of: NaiveDate,
    stations_by_prefix: Cache<String, Arc<Sourced<Vec<ChargingStation>>>>,
    regional_by_code: Cache<String, Arc<Sourced<Option<RegionalMarket>>>>,
    fuel_price: Cache<&'static str, Sourced<f64>>,
}

impl EnrichmentEngine {
    pub fn new(
        market: Arc<MarketData>,
        cache: CacheStore,
        gateways: Gateways,
        force_refresh: bool,
        as_of: NaiveDate,
    ) -> Self {
        Self {
            market,
            cache,
            gateways,
            force_refresh,
            as_of,
            stations_by_prefix: Cache::new(256),
            regional_by_code: Cache::new(64),
            fuel_price: Cache::new(1),
        }
    }

    pub fn market(&self) -> &MarketData {
        &self.market
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Runs every layer for one record. Gateway-backed layers run
    /// concurrently; none of them can fail the record.
    pub async fn enrich(&self, record: &CleanRecord) -> EnrichmentContext {
        let wealth = self.wealth_layer(record);
        let (infrastructure, tax, regional) = tokio::join!(
            self.infrastructure_layer(record),
            self.tax_layer(record),
            self.regional_layer(record),
        );
        let renewal = renewal_layer(&self.market, record.registration_date, self.as_of);

        EnrichmentContext {
            wealth,
            infrastructure,
            tax,
            renewal,
            regional,
        }
    }

    // ============ 1. Wealth proxy ============

    pub fn wealth_layer(&self, record: &CleanRecord) -> Sourced<WealthProxy> {
        wealth_layer(&self.market, record)
    }

    // ============ 2. Infrastructure proximity ============

    pub async fn infrastructure_layer(
        &self,
        record: &CleanRecord,
    ) -> Sourced<Option<ChargerProximity>> {
        let Some(postal) = record.postal_code.as_deref() else {
            return Sourced::new(None, SourceConfidence::Heuristic);
        };
        let Some(origin) = self.market.coordinates_for_postal(postal) else {
            return Sourced::new(None, SourceConfidence::Heuristic);
        };
        let Some(prefix) = postal.get(..2) else {
            return Sourced::new(None, SourceConfidence::Heuristic);
        };

        let center = self.market.coordinates_for_postal(prefix).unwrap_or(origin);
        let stations = self
            .stations_by_prefix
            .get_with(prefix.to_string(), async {
                Arc::new(self.regional_stations(prefix, center).await)
            })
            .await;

        let min_kw = self.market.fast_charger_min_kw;
        let fast = stations.value.iter().filter(|s| s.power_kw >= min_kw);
        let nearest = geo::nearest(origin, fast, |s| (s.lat, s.lon)).map(|(station, d)| {
            ChargerProximity {
                distance_km: d,
                station: station.name.clone(),
                power_kw: station.power_kw,
            }
        });

        Sourced::new(nearest, stations.confidence)
    }

    async fn regional_stations(
        &self,
        prefix: &str,
        center: (f64, f64),
    ) -> Sourced<Vec<ChargingStation>> {
        let min_kw = self.market.fast_charger_min_kw;
        let fetched = self
            .cache
            .get_or_fetch(prefix, CacheCategory::Infrastructure, self.force_refresh, || async {
                let service = self
                    .gateways
                    .chargers
                    .as_ref()
                    .ok_or_else(|| FetchError::Disabled("charger directory".into()))?;
                let stations = service
                    .stations_near(center.0, center.1, CHARGER_SEARCH_RADIUS_KM, min_kw)
                    .await?;
                serde_json::to_value(stations).map_err(|e| FetchError::Decode(e.to_string()))
            })
            .await;

        let decoded = fetched.map(|s| {
            (
                serde_json::from_value::<Vec<ChargingStation>>(s.value),
                s.confidence,
            )
        });
        match decoded {
            Ok((Ok(stations), confidence)) if !stations.is_empty() => {
                Sourced::new(stations, confidence)
            }
            Ok((Ok(_), _)) => {
                tracing::warn!(
                    "⚠️ No fast chargers listed near region {}, using static directory",
                    prefix
                );
                self.static_stations()
            }
            Ok((Err(e), _)) => {
                tracing::warn!("⚠️ Cached charger payload for {} unreadable: {}", prefix, e);
                self.static_stations()
            }
            Err(e) => {
                tracing::debug!("Charger directory unavailable for {}: {}", prefix, e);
                self.static_stations()
            }
        }
    }

    fn static_stations(&self) -> Sourced<Vec<ChargingStation>> {
        let stations = self
            .market
            .fast_chargers()
            .map(|c| ChargingStation {
                name: c.name.clone(),
                lat: c.lat,
                lon: c.lon,
                power_kw: c.power_kw,
            })
            .collect();
        Sourced::new(stations, SourceConfidence::StaticFallback)
    }

    // ============ 3. Tax / subsidy ============

    pub async fn tax_layer(&self, record: &CleanRecord) -> Sourced<TaxBenefit> {
        let price = self
            .fuel_price
            .get_with(FUEL_PRICE_KEY, self.resolve_fuel_price())
            .await;

        let profile = self.market.industry_profile(record.industry_code.as_deref());
        let rate = self
            .market
            .legal_form_rate(record.legal_form.as_deref())
            .max(profile.tax_rate);

        let benefit =
            compute_tax_benefit(&self.market.tax, rate, price.value, record.family_status);
        Sourced::new(benefit, price.confidence)
    }

    async fn resolve_fuel_price(&self) -> Sourced<f64> {
        let fetched = self
            .cache
            .get_or_fetch(FUEL_PRICE_KEY, CacheCategory::Price, self.force_refresh, || async {
                let service = self
                    .gateways
                    .fuel
                    .as_ref()
                    .ok_or_else(|| FetchError::Disabled("fuel price".into()))?;
                Ok(json!(service.fetch_price().await?))
            })
            .await;

        match fetched {
            Ok(sourced) => match sourced.value.as_f64().filter(|p| *p > 0.0) {
                Some(price) => Sourced::new(price, sourced.confidence),
                None => {
                    tracing::warn!("⚠️ Cached fuel price unreadable, using static price");
                    self.static_fuel_price()
                }
            },
            Err(e) => {
                tracing::debug!("Fuel price unavailable: {}", e);
                self.static_fuel_price()
            }
        }
    }

    fn static_fuel_price(&self) -> Sourced<f64> {
        Sourced::new(self.market.tax.fallback_fuel_price, SourceConfidence::StaticFallback)
    }

    // ============ Regional registry signal ============

    pub async fn regional_layer(&self, record: &CleanRecord) -> Sourced<Option<RegionalMarket>> {
        let Some(region) = record
            .postal_code
            .as_deref()
            .and_then(|p| self.market.voivodeship_for_postal(p))
        else {
            return Sourced::new(None, SourceConfidence::Heuristic);
        };

        let resolved = self
            .regional_by_code
            .get_with(region.code.clone(), async {
                Arc::new(
                    self.resolve_regional(&region.code, &region.name, region.premium_estimate)
                        .await,
                )
            })
            .await;
        resolved.as_ref().clone()
    }

    async fn resolve_regional(
        &self,
        code: &str,
        name: &str,
        static_estimate: u64,
    ) -> Sourced<Option<RegionalMarket>> {
        let cache_key = format!("{}:{}", code, self.as_of.format("%Y-%m"));
        let fetched = self
            .cache
            .get_or_fetch(&cache_key, CacheCategory::Registry, self.force_refresh, || async {
                let service = self
                    .gateways
                    .registry
                    .as_ref()
                    .ok_or_else(|| FetchError::Disabled("vehicle registry".into()))?;
                let count = service
                    .premium_registrations(code, &self.market.premium_brands, self.as_of)
                    .await?;
                Ok(json!({ "count": count }))
            })
            .await;

        let market = |count| RegionalMarket {
            voivodeship: name.to_string(),
            premium_registrations: count,
        };

        match fetched.map(|s| (s.value.get("count").and_then(Value::as_u64), s.confidence)) {
            Ok((Some(count), confidence)) => Sourced::new(Some(market(count)), confidence),
            Ok((None, _)) => {
                tracing::warn!("⚠️ Cached registry payload for {} unreadable", code);
                Sourced::new(Some(market(static_estimate)), SourceConfidence::StaticFallback)
            }
            Err(e) => {
                tracing::debug!("Registry unavailable for region {}: {}", code, e);
                Sourced::new(Some(market(static_estimate)), SourceConfidence::StaticFallback)
            }
        }
    }
}

/// Maps the price ratio to the national average onto a 1-10 score.
pub fn wealth_score_for_ratio(ratio: f64) -> u8 {
    const STEPS: [(f64, u8); 9] = [
        (1.5, 10),
        (1.3, 9),
        (1.15, 8),
        (1.0, 7),
        (0.9, 6),
        (0.8, 5),
        (0.7, 4),
        (0.6, 3),
        (0.5, 2),
    ];
    STEPS
        .iter()
        .find(|(min, _)| ratio >= *min)
        .map(|(_, score)| *score)
        .unwrap_or(1)
}

/// Wealth proxy fallback chain: known city table, premium street keyword,
/// industry correlation, then the default "Standard" estimate.
pub fn wealth_layer(market: &MarketData, record: &CleanRecord) -> Sourced<WealthProxy> {
    let postal_city = record
        .postal_code
        .as_deref()
        .and_then(|p| market.city_for_postal(p));

    let known_city = record
        .city
        .as_deref()
        .and_then(|c| market.city_sqm_price(c))
        .or_else(|| postal_city.and_then(|c| market.city_sqm_price(c)));

    if let Some((city, price)) = known_city {
        let ratio = price / market.national_avg_sqm_price;
        let score = wealth_score_for_ratio(ratio);
        return Sourced::new(
            WealthProxy {
                score,
                tier: WealthTier::from_score(score),
                resolved_city: Some(city.to_string()),
                sqm_price: Some(price),
                signal: format!(
                    "{}: {:.0} PLN/m² ({:.2}x national average)",
                    city, price, ratio
                ),
            },
            SourceConfidence::StaticFallback,
        );
    }

    let resolved_city = record
        .city
        .clone()
        .or_else(|| postal_city.map(str::to_string));
    let heuristic = |score: u8, signal: String| {
        Sourced::new(
            WealthProxy {
                score,
                tier: WealthTier::from_score(score),
                resolved_city: resolved_city.clone(),
                sqm_price: None,
                signal,
            },
            SourceConfidence::Heuristic,
        )
    };

    if let Some(keyword) = record
        .street
        .as_deref()
        .and_then(|s| market.premium_street_keyword(s))
    {
        return heuristic(
            PREMIUM_STREET_WEALTH_SCORE,
            format!("premium address keyword '{}'", keyword),
        );
    }

    if let Some((code, score)) = record
        .industry_code
        .as_deref()
        .and_then(|c| market.industry_wealth(c).map(|s| (c, s)))
    {
        return heuristic(score, format!("industry {} wealth correlation", code));
    }

    heuristic(DEFAULT_WEALTH_SCORE, "no location data, default estimate".to_string())
}

/// Age bands over `as_of`; unknown age gets the neutral propensity.
pub fn renewal_layer(
    market: &MarketData,
    registration_date: Option<NaiveDate>,
    as_of: NaiveDate,
) -> Sourced<RenewalCycle> {
    let Some(date) = registration_date else {
        return Sourced::new(
            RenewalCycle {
                age_years: None,
                band: "UNKNOWN".to_string(),
                propensity: market.unknown_age_propensity,
            },
            SourceConfidence::Heuristic,
        );
    };

    let days = (as_of - date).num_days();
    if days < 0 {
        tracing::debug!("Registration date {} is after {}, treating age as 0", date, as_of);
    }
    let age_years = days.max(0) as f64 / 365.25;

    match market.renewal_band(age_years) {
        Some(band) => Sourced::new(
            RenewalCycle {
                age_years: Some(age_years),
                band: band.band.clone(),
                propensity: band.propensity,
            },
            SourceConfidence::StaticFallback,
        ),
        None => Sourced::new(
            RenewalCycle {
                age_years: Some(age_years),
                band: "UNKNOWN".to_string(),
                propensity: market.unknown_age_propensity,
            },
            SourceConfidence::Heuristic,
        ),
    }
}

fn non_negative(label: &str, value: f64) -> f64 {
    if value < 0.0 || value.is_nan() {
        tracing::warn!("⚠️ Negative {} ({:.2}) clamped to 0", label, value);
        0.0
    } else {
        value
    }
}

/// Annual running costs, depreciation-limit benefit and subsidy. Every
/// monetary output is non-negative.
pub fn compute_tax_benefit(
    params: &TaxParameters,
    tax_rate: f64,
    fuel_price: f64,
    family_status: bool,
) -> TaxBenefit {
    let fuel_price = non_negative("fuel price", fuel_price);
    let tax_rate = non_negative("tax rate", tax_rate);
    let hundreds_km = non_negative("annual distance", params.annual_km) / 100.0;

    let fuel_cost_annual =
        hundreds_km * non_negative("fuel consumption", params.fuel_litres_per_100km) * fuel_price;
    let electric_cost_annual =
        hundreds_km * non_negative("electric cost", params.electric_cost_per_100km);
    let operating_savings_annual =
        non_negative("operating savings", fuel_cost_annual - electric_cost_annual);

    let limit_difference = non_negative(
        "depreciation limit difference",
        params.ev_depreciation_limit - params.ice_depreciation_limit,
    );
    let subsidy_amount = if family_status {
        params.subsidy_family
    } else {
        params.subsidy_standard
    };

    TaxBenefit {
        tax_rate,
        fuel_price,
        fuel_cost_annual,
        electric_cost_annual,
        operating_savings_annual,
        tax_benefit_annual: limit_difference * tax_rate,
        subsidy_amount: non_negative("subsidy", subsidy_amount),
    }
}

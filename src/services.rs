use crate::errors::FetchError;
use crate::gateway_client::HttpGateway;
use chrono::{Months, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Counts above this are treated as a data-integrity fault.
pub const REGISTRY_COUNT_SANITY_CAP: u64 = 5_000_000;
/// Plausible commodity price range (PLN per litre), lower bound exclusive.
pub const FUEL_PRICE_MAX: f64 = 20.0;
/// A single proximity query never legitimately returns more stations.
pub const CHARGER_RESULT_SANITY_CAP: usize = 10_000;

// ============ Vehicle registry ============

/// Government vehicle-registry client (paginated registration listings).
#[derive(Clone)]
pub struct VehicleRegistryService {
    gateway: HttpGateway,
    page_size: usize,
    max_pages: usize,
}

impl VehicleRegistryService {
    pub fn new(gateway: HttpGateway, page_size: usize, max_pages: usize) -> Self {
        Self {
            gateway,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// Registrations of one brand in one region within `[from, to]`.
    ///
    /// Pages are accumulated until a short page or the page cap. A 404 for
    /// a brand means no registrations, not a failure.
    pub async fn count_registrations(
        &self,
        region_code: &str,
        brand: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<u64, FetchError> {
        let mut total: u64 = 0;

        for page in 1..=self.max_pages {
            let query = [
                ("wojewodztwo", region_code.to_string()),
                ("data-od", from.format("%Y%m%d").to_string()),
                ("data-do", to.format("%Y%m%d").to_string()),
                ("filter[marka]", brand.to_string()),
                ("page", page.to_string()),
                ("limit", self.page_size.to_string()),
            ];

            let body = match self.gateway.get_json("/pojazdy", &query).await {
                Ok(body) => body,
                Err(FetchError::Semantic { status: 404, .. }) => {
                    tracing::debug!("Registry has no {} data in region {}", brand, region_code);
                    break;
                }
                Err(e) => return Err(e),
            };

            let items = body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::Decode("registry page is missing a data array".into()))?;

            let page_count = items.len();
            total += page_count as u64;
            tracing::debug!(
                "Registry page {}: {} items for {} (total so far: {})",
                page,
                page_count,
                brand,
                total
            );

            if page_count < self.page_size {
                break;
            }
            if page == self.max_pages {
                tracing::warn!(
                    "⚠️ Registry page cap ({}) reached for {} in region {}",
                    self.max_pages,
                    brand,
                    region_code
                );
            }
        }

        if total > REGISTRY_COUNT_SANITY_CAP {
            return Err(FetchError::DataIntegrity(format!(
                "{} registrations of {} in region {} exceeds plausible bound",
                total, brand, region_code
            )));
        }

        Ok(total)
    }

    /// Premium registrations from three years before `as_of` (a quarter
    /// window), i.e. leases ending around now.
    pub async fn premium_registrations(
        &self,
        region_code: &str,
        brands: &[String],
        as_of: NaiveDate,
    ) -> Result<u64, FetchError> {
        let (from, to) = lease_window(as_of);

        let mut total = 0u64;
        for brand in brands {
            let count = self.count_registrations(region_code, brand, from, to).await?;
            tracing::info!(
                "✓ Registry: {} {} registrations in region {}",
                count,
                brand,
                region_code
            );
            total += count;
        }

        if total == 0 || total > REGISTRY_COUNT_SANITY_CAP {
            return Err(FetchError::DataIntegrity(format!(
                "implausible premium registration total {} for region {}",
                total, region_code
            )));
        }

        Ok(total)
    }
}

/// Quarter ending exactly three years before `as_of`.
pub fn lease_window(as_of: NaiveDate) -> (NaiveDate, NaiveDate) {
    let to = as_of.checked_sub_months(Months::new(36)).unwrap_or(as_of);
    let from = to.checked_sub_months(Months::new(3)).unwrap_or(to);
    (from, to)
}

// ============ Fuel price ============

static PB95_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:pb\s*95|e95)\D{0,40}?(\d+)[,.](\d{2})").expect("valid regex")
});
static ANY_PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)[,.](\d{2})").expect("valid regex"));

/// Commodity (petrol) price source. Accepts a JSON document or a text/HTML
/// page with a quoted price.
#[derive(Clone)]
pub struct FuelPriceService {
    gateway: HttpGateway,
}

impl FuelPriceService {
    pub fn new(gateway: HttpGateway) -> Self {
        Self { gateway }
    }

    pub async fn fetch_price(&self) -> Result<f64, FetchError> {
        let body = self.gateway.get_text("", &[]).await?;
        let price = parse_fuel_price(&body)?;
        tracing::info!("✓ Fuel price fetched: {:.2} PLN/l", price);
        Ok(price)
    }
}

/// Extracts the petrol price and checks it is plausible.
pub fn parse_fuel_price(body: &str) -> Result<f64, FetchError> {
    let price = match serde_json::from_str::<Value>(body) {
        Ok(json) => ["Pb95", "pb95", "price"]
            .iter()
            .find_map(|k| json.get(*k))
            .and_then(|v| v.as_f64().or_else(|| v.as_str()?.replace(',', ".").parse().ok()))
            .ok_or_else(|| FetchError::Decode("no price field in fuel price document".into()))?,
        Err(_) => {
            let caps = PB95_PRICE_RE
                .captures(body)
                .or_else(|| ANY_PRICE_RE.captures(body))
                .ok_or_else(|| FetchError::Decode("no price found in fuel price page".into()))?;
            format!("{}.{}", &caps[1], &caps[2])
                .parse::<f64>()
                .map_err(|e| FetchError::Decode(e.to_string()))?
        }
    };

    if !(price > 0.0 && price <= FUEL_PRICE_MAX) {
        return Err(FetchError::DataIntegrity(format!(
            "fuel price {} outside (0, {}]",
            price, FUEL_PRICE_MAX
        )));
    }
    Ok(price)
}

// ============ Charger directory ============

/// One charging location, normalized from the directory's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingStation {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Highest connector power at the site.
    pub power_kw: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PoiRecord {
    address_info: Option<PoiAddress>,
    #[serde(default)]
    connections: Vec<PoiConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PoiAddress {
    title: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PoiConnection {
    #[serde(rename = "PowerKW")]
    power_kw: Option<f64>,
}

/// Charging-infrastructure directory client (OpenChargeMap-compatible).
#[derive(Clone)]
pub struct ChargerDirectoryService {
    gateway: HttpGateway,
    api_key: Option<String>,
}

impl ChargerDirectoryService {
    pub fn new(gateway: HttpGateway, api_key: Option<String>) -> Self {
        Self { gateway, api_key }
    }

    /// Stations of at least `min_power_kw` within `radius_km` of a point.
    pub async fn stations_near(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        min_power_kw: f64,
    ) -> Result<Vec<ChargingStation>, FetchError> {
        let mut query = vec![
            ("output", "json".to_string()),
            ("countrycode", "PL".to_string()),
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
            ("distance", radius_km.to_string()),
            ("distanceunit", "KM".to_string()),
            ("minpowerkw", min_power_kw.to_string()),
            ("maxresults", "100".to_string()),
            ("compact", "true".to_string()),
            ("verbose", "false".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }

        let body = self.gateway.get_json("/poi/", &query).await?;
        let stations = parse_stations(body, min_power_kw)?;
        tracing::info!(
            "✓ Charger directory: {} fast stations near ({:.4}, {:.4})",
            stations.len(),
            lat,
            lon
        );
        Ok(stations)
    }
}

/// Normalizes a directory response, dropping sites without coordinates or
/// below the power threshold.
pub fn parse_stations(body: Value, min_power_kw: f64) -> Result<Vec<ChargingStation>, FetchError> {
    let records: Vec<PoiRecord> = serde_json::from_value(body)
        .map_err(|e| FetchError::Decode(format!("charger directory: {}", e)))?;

    if records.len() > CHARGER_RESULT_SANITY_CAP {
        return Err(FetchError::DataIntegrity(format!(
            "charger directory returned {} sites",
            records.len()
        )));
    }

    Ok(records
        .into_iter()
        .filter_map(|poi| {
            let address = poi.address_info?;
            let power_kw = poi
                .connections
                .iter()
                .filter_map(|c| c.power_kw)
                .fold(0.0_f64, f64::max);
            Some(ChargingStation {
                name: address.title.unwrap_or_else(|| "Unnamed station".to_string()),
                lat: address.latitude?,
                lon: address.longitude?,
                power_kw,
            })
        })
        .filter(|s| s.power_kw >= min_power_kw)
        .collect())
}

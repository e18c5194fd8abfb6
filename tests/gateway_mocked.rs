/// Integration tests with mocked external sources
/// Exercises the gateways, the narrative client and the engine's fallback
/// chain without hitting real services.
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use lead_sniper::cache_store::{CacheCategory, CacheEntry, CacheStore, CacheTtls};
use lead_sniper::enrichment::{EnrichmentEngine, Gateways};
use lead_sniper::errors::FetchError;
use lead_sniper::gateway_client::{GatewaySettings, HttpGateway};
use lead_sniper::market_data::MarketData;
use lead_sniper::models::{CleanRecord, SourceConfidence};
use lead_sniper::services::{ChargerDirectoryService, FuelPriceService, VehicleRegistryService};
use lead_sniper::synthesis::{HttpNarrativeClient, NarrativeGenerator};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper: fast settings so retries don't slow the suite down
fn test_settings(max_retries: u32) -> GatewaySettings {
    GatewaySettings {
        timeout: Duration::from_secs(2),
        max_retries,
        initial_backoff: Duration::from_millis(5),
        concurrency: 2,
    }
}

fn gateway(name: &'static str, server: &MockServer, max_retries: u32) -> HttpGateway {
    HttpGateway::new(name, &server.uri(), test_settings(max_retries)).unwrap()
}

fn items(n: usize) -> serde_json::Value {
    json!({ "data": (0..n).map(|i| json!({ "id": i })).collect::<Vec<_>>() })
}

fn poi(title: &str, lat: f64, lon: f64, kw: f64) -> serde_json::Value {
    json!({
        "AddressInfo": { "Title": title, "Latitude": lat, "Longitude": lon },
        "Connections": [ { "PowerKW": 22.0 }, { "PowerKW": kw } ]
    })
}

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items(3)))
        .mount(&server)
        .await;

    let registry = VehicleRegistryService::new(gateway("registry", &server, 3), 500, 10);
    let count = registry
        .count_registrations("24", "BMW", as_of(), as_of())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let registry = VehicleRegistryService::new(gateway("registry", &server, 3), 500, 10);
    let count = registry
        .count_registrations("24", "AUDI", as_of(), as_of())
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_registry_pagination_stops_on_short_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .and(query_param("page", "1"))
        .and(query_param("wojewodztwo", "24"))
        .and(query_param("filter[marka]", "VOLVO"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items(2)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items(1)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items(2)))
        .expect(0)
        .mount(&server)
        .await;

    let registry = VehicleRegistryService::new(gateway("registry", &server, 0), 2, 10);
    let count = registry
        .count_registrations("24", "VOLVO", as_of(), as_of())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_zero_premium_total_is_a_data_integrity_fault() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items(0)))
        .mount(&server)
        .await;

    let registry = VehicleRegistryService::new(gateway("registry", &server, 0), 500, 10);
    let brands = vec!["BMW".to_string(), "AUDI".to_string()];
    let err = registry
        .premium_registrations("24", &brands, as_of())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::DataIntegrity(_)), "{:?}", err);
}

#[tokio::test]
async fn test_charger_directory_filters_and_sends_key() {
    let server = MockServer::start().await;

    let body = json!([
        poi("Supercharger Katowice", 50.2649, 19.0238, 250.0),
        poi("Slow AC", 50.26, 19.02, 11.0),
        { "AddressInfo": { "Title": "No coordinates" }, "Connections": [ { "PowerKW": 150.0 } ] }
    ]);
    Mock::given(method("GET"))
        .and(path("/poi/"))
        .and(query_param("countrycode", "PL"))
        .and(query_param("key", "secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let directory = ChargerDirectoryService::new(
        gateway("charger_directory", &server, 0),
        Some("secret-key".to_string()),
    );
    let stations = directory.stations_near(50.26, 19.02, 60.0, 50.0).await.unwrap();

    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].name, "Supercharger Katowice");
    assert_eq!(stations[0].power_kw, 250.0);
}

#[tokio::test]
async fn test_fuel_price_bounds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Pb95": 6.19 })))
        .mount(&server)
        .await;
    let fuel = FuelPriceService::new(gateway("fuel_price", &server, 0));
    assert_eq!(fuel.fetch_price().await.unwrap(), 6.19);

    let absurd = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Pb95": 61.9 })))
        .mount(&absurd)
        .await;
    let fuel = FuelPriceService::new(gateway("fuel_price", &absurd, 0));
    assert!(matches!(
        fuel.fetch_price().await.unwrap_err(),
        FetchError::DataIntegrity(_)
    ));
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let gateway = gateway("flaky", &server, 0);
    for _ in 0..5 {
        let err = gateway.get_json("/x", &[]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    let err = gateway.get_json("/x", &[]).await.unwrap_err();
    assert!(matches!(err, FetchError::CircuitOpen(_)), "{:?}", err);
}

#[tokio::test]
async fn test_narrative_client_posts_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_partial_json(json!({ "tier": "S" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "message": "  Dzień dobry!  " })),
        )
        .mount(&server)
        .await;

    let client = HttpNarrativeClient::new(gateway("narrative", &server, 0));
    let text = client.generate(&json!({ "tier": "S" })).await.unwrap();
    assert_eq!(text, "Dzień dobry!");
}

#[tokio::test]
async fn test_narrative_client_rejects_empty_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "" })))
        .mount(&server)
        .await;

    let client = HttpNarrativeClient::new(gateway("narrative", &server, 0));
    assert!(matches!(
        client.generate(&json!({})).await.unwrap_err(),
        FetchError::Decode(_)
    ));
}

fn katowice_record() -> CleanRecord {
    CleanRecord {
        city: Some("Katowice".into()),
        postal_code: Some("40-001".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_live_charger_lookup_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poi/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([poi("Live Station", 50.2700, 19.0300, 150.0)])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache = CacheStore::in_memory(100, CacheTtls::default());
    let gateways = Gateways {
        chargers: Some(ChargerDirectoryService::new(
            gateway("charger_directory", &server, 0),
            None,
        )),
        ..Gateways::disabled()
    };
    let market = Arc::new(MarketData::bundled().unwrap());
    let engine = EnrichmentEngine::new(market, cache.clone(), gateways, false, as_of());

    let first = engine.infrastructure_layer(&katowice_record()).await;
    assert_eq!(first.confidence, SourceConfidence::Live);
    assert_eq!(first.value.as_ref().unwrap().station, "Live Station");

    let second = engine.infrastructure_layer(&katowice_record()).await;
    assert_eq!(second, first);

    let (_, fresh) = cache.get("40", CacheCategory::Infrastructure).await.unwrap();
    assert!(fresh);
}

#[tokio::test]
async fn test_stale_cache_is_served_when_gateway_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poi/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let cache = CacheStore::in_memory(100, CacheTtls::default());
    cache
        .insert_entry(CacheEntry {
            key: "40".into(),
            category: CacheCategory::Infrastructure,
            payload: json!([
                { "name": "Cached Station", "lat": 50.2649, "lon": 19.0238, "power_kw": 120.0 }
            ]),
            fetched_at: Utc::now() - ChronoDuration::hours(400),
        })
        .await;

    let gateways = Gateways {
        chargers: Some(ChargerDirectoryService::new(
            gateway("charger_directory", &server, 1),
            None,
        )),
        ..Gateways::disabled()
    };
    let market = Arc::new(MarketData::bundled().unwrap());
    let engine = EnrichmentEngine::new(market, cache, gateways, false, as_of());

    let layer = engine.infrastructure_layer(&katowice_record()).await;
    assert_eq!(layer.confidence, SourceConfidence::CachedStale);
    let charger = layer.value.expect("stale value must be served, not dropped");
    assert_eq!(charger.station, "Cached Station");
    assert!(charger.distance_km < 1.0);
}

#[tokio::test]
async fn test_registry_failure_falls_back_to_static_estimate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pojazdy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": true })))
        .mount(&server)
        .await;

    let gateways = Gateways {
        registry: Some(VehicleRegistryService::new(gateway("registry", &server, 0), 500, 10)),
        ..Gateways::disabled()
    };
    let market = Arc::new(MarketData::bundled().unwrap());
    let engine = EnrichmentEngine::new(
        market,
        CacheStore::in_memory(100, CacheTtls::default()),
        gateways,
        false,
        as_of(),
    );

    let regional = engine.regional_layer(&katowice_record()).await;
    assert_eq!(regional.confidence, SourceConfidence::StaticFallback);
    let region = regional.value.unwrap();
    assert_eq!(region.voivodeship, "ŚLĄSKIE");
    assert_eq!(region.premium_registrations, 3245);
}

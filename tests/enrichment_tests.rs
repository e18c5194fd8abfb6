/// Offline enrichment tests: fallback chains, tax arithmetic and regional
/// estimates with every gateway disabled.
use chrono::NaiveDate;
use lead_sniper::cache_store::{CacheStore, CacheTtls};
use lead_sniper::enrichment::{compute_tax_benefit, renewal_layer, EnrichmentEngine, Gateways};
use lead_sniper::market_data::MarketData;
use lead_sniper::models::{CleanRecord, SourceConfidence, WealthTier};
use std::sync::Arc;

fn market() -> Arc<MarketData> {
    Arc::new(MarketData::bundled().unwrap())
}

fn engine() -> EnrichmentEngine {
    EnrichmentEngine::new(
        market(),
        CacheStore::in_memory(100, CacheTtls::default()),
        Gateways::disabled(),
        false,
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
    )
}

#[cfg(test)]
mod wealth_tests {
    use super::*;

    #[test]
    fn test_premium_street_keyword() {
        let record = CleanRecord {
            city: Some("Wólka".into()),
            street: Some("ul. Marszałkowska 10".into()),
            ..Default::default()
        };
        let wealth = engine().wealth_layer(&record);

        assert_eq!(wealth.value.score, 7);
        assert_eq!(wealth.value.tier, WealthTier::High);
        assert_eq!(wealth.value.resolved_city.as_deref(), Some("Wólka"));
        assert!(wealth.value.signal.contains("Marszałkowska"));
        assert_eq!(wealth.confidence, SourceConfidence::Heuristic);
    }

    #[test]
    fn test_industry_correlation() {
        let record = CleanRecord {
            industry_code: Some("6920Z".into()),
            ..Default::default()
        };
        let wealth = engine().wealth_layer(&record);

        assert_eq!(wealth.value.score, 8);
        assert_eq!(wealth.value.sqm_price, None);
        assert_eq!(wealth.confidence, SourceConfidence::Heuristic);
    }

    #[test]
    fn test_known_city_beats_street_keyword() {
        let record = CleanRecord {
            city: Some("Kraków".into()),
            street: Some("Rynek Główny 1".into()),
            ..Default::default()
        };
        let wealth = engine().wealth_layer(&record);

        assert_eq!(wealth.value.sqm_price, Some(15_200.0));
        assert_eq!(wealth.confidence, SourceConfidence::StaticFallback);
    }
}

#[cfg(test)]
mod tax_tests {
    use super::*;

    #[tokio::test]
    async fn test_legal_form_raises_rate() {
        let record = CleanRecord {
            legal_form: Some("Spółka jawna".into()),
            ..Default::default()
        };
        let tax = engine().tax_layer(&record).await;

        assert_eq!(tax.value.tax_rate, 0.32);
        assert!((tax.value.tax_benefit_annual - 24_000.0).abs() < 1e-6);
        assert_eq!(tax.confidence, SourceConfidence::StaticFallback);
    }

    #[tokio::test]
    async fn test_offline_fuel_price_is_static() {
        let tax = engine().tax_layer(&CleanRecord::default()).await;

        assert_eq!(tax.value.fuel_price, 6.05);
        // 150 x 7.5 l x 6.05 PLN
        assert!((tax.value.fuel_cost_annual - 6_806.25).abs() < 1e-6);
        assert!((tax.value.electric_cost_annual - 1_200.0).abs() < 1e-6);
        assert!((tax.value.operating_savings_annual - 5_606.25).abs() < 1e-6);
    }

    #[test]
    fn test_family_status_subsidy() {
        let market = market();
        let standard = compute_tax_benefit(&market.tax, 0.19, 6.05, false);
        let family = compute_tax_benefit(&market.tax, 0.19, 6.05, true);

        assert_eq!(standard.subsidy_amount, 27_000.0);
        assert_eq!(family.subsidy_amount, 40_000.0);
    }
}

#[cfg(test)]
mod regional_tests {
    use super::*;

    #[tokio::test]
    async fn test_static_estimate_per_voivodeship() {
        let engine = engine();
        let record = |postal: &str| CleanRecord {
            postal_code: Some(postal.into()),
            ..Default::default()
        };

        let silesia = engine.regional_layer(&record("40-001")).await;
        let market = silesia.value.unwrap();
        assert_eq!(market.voivodeship, "ŚLĄSKIE");
        assert_eq!(market.premium_registrations, 3_245);
        assert_eq!(silesia.confidence, SourceConfidence::StaticFallback);

        let masovia = engine.regional_layer(&record("00-950")).await;
        assert_eq!(masovia.value.unwrap().premium_registrations, 8_127);
    }

    #[tokio::test]
    async fn test_no_postal_code_is_heuristic() {
        let regional = engine().regional_layer(&CleanRecord::default()).await;
        assert!(regional.value.is_none());
        assert_eq!(regional.confidence, SourceConfidence::Heuristic);
    }
}

#[cfg(test)]
mod renewal_tests {
    use super::*;

    #[test]
    fn test_future_registration_is_age_zero() {
        let as_of = NaiveDate::from_ymd_opt(2025, 6, 30).unwrap();
        let renewal = renewal_layer(&market(), NaiveDate::from_ymd_opt(2026, 1, 1), as_of);

        assert_eq!(renewal.value.age_years, Some(0.0));
        assert_eq!(renewal.value.band, "EARLY_STAGE");
    }

    #[test]
    fn test_renewal_window() {
        let as_of = NaiveDate::from_ymd_opt(2025, 6, 30).unwrap();
        let renewal = renewal_layer(&market(), NaiveDate::from_ymd_opt(2021, 3, 1), as_of);

        assert_eq!(renewal.value.band, "RENEWAL_WINDOW");
        assert_eq!(renewal.value.propensity, 0.95);
    }
}

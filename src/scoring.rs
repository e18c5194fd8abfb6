/// Scoring matrix: five bounded sub-scores summed to a 0-100 total, then
/// mapped to a tier through the market data threshold table.
use crate::market_data::MarketData;
use crate::models::{CleanRecord, EnrichmentContext, ScoreBreakdown, WealthTier};
use std::sync::Arc;

/// `(upper boundary in years, points)`; past the last boundary scores 18.
const AGE_BANDS: [(f64, u8); 5] = [(1.0, 5), (2.0, 10), (3.0, 15), (6.0, 20), (7.0, 18)];
const AGE_BEYOND: u8 = 18;

/// `(upper boundary in km, points)`; farther scores 0.
const DISTANCE_BANDS: [(f64, u8); 5] = [(5.0, 15), (10.0, 12), (20.0, 9), (30.0, 6), (50.0, 3)];
const DISTANCE_BEYOND: u8 = 0;

const PHONE_POINTS: u8 = 5;
const EMAIL_POINTS: u8 = 3;
const WEBSITE_POINTS: u8 = 2;

/// Step function over ascending upper boundaries. A value sitting exactly
/// on a boundary takes the lower of the two neighbouring bands.
pub fn step_score(value: f64, bands: &[(f64, u8)], beyond: u8) -> u8 {
    for (i, (upper, points)) in bands.iter().enumerate() {
        if value < *upper {
            return *points;
        }
        if value == *upper {
            let next = bands.get(i + 1).map(|(_, p)| *p).unwrap_or(beyond);
            return (*points).min(next);
        }
    }
    beyond
}

pub fn wealth_points(tier: WealthTier) -> u8 {
    match tier {
        WealthTier::Premium => 25,
        WealthTier::High => 20,
        WealthTier::Medium => 15,
        WealthTier::Standard => 10,
        WealthTier::Low => 5,
    }
}

/// Age points; `None` when the age is unknown.
pub fn age_points(age_years: Option<f64>) -> Option<u8> {
    age_years.map(|age| step_score(age.max(0.0), &AGE_BANDS, AGE_BEYOND))
}

/// Distance points; an unknown distance scores 0.
pub fn distance_points(distance_km: Option<f64>) -> u8 {
    distance_km
        .map(|d| step_score(d.max(0.0), &DISTANCE_BANDS, DISTANCE_BEYOND))
        .unwrap_or(0)
}

pub fn contact_points(record: &CleanRecord) -> u8 {
    let mut points = 0;
    if record.phone.is_some() {
        points += PHONE_POINTS;
    }
    if record.email.is_some() {
        points += EMAIL_POINTS;
    }
    if record.website.is_some() {
        points += WEBSITE_POINTS;
    }
    points
}

/// Sum of the sub-scores, clamped to 0-100.
pub fn total_score(parts: [u8; 5]) -> u8 {
    parts
        .iter()
        .map(|p| u32::from(*p))
        .sum::<u32>()
        .min(100) as u8
}

#[derive(Clone)]
pub struct ScoringMatrix {
    market: Arc<MarketData>,
}

impl ScoringMatrix {
    pub fn new(market: Arc<MarketData>) -> Self {
        Self { market }
    }

    pub fn score(&self, context: &EnrichmentContext, record: &CleanRecord) -> ScoreBreakdown {
        let industry = self
            .market
            .industry_profile(record.industry_code.as_deref())
            .points
            .min(ScoreBreakdown::MAX_INDUSTRY);
        let wealth = wealth_points(context.wealth.value.tier).min(ScoreBreakdown::MAX_WEALTH);
        let age = age_points(context.renewal.value.age_years);
        let company_age = age.unwrap_or(0).min(ScoreBreakdown::MAX_COMPANY_AGE);
        let infrastructure =
            distance_points(context.charger_distance_km()).min(ScoreBreakdown::MAX_INFRASTRUCTURE);
        let contact_quality = contact_points(record).min(ScoreBreakdown::MAX_CONTACT_QUALITY);

        let total = total_score([industry, wealth, company_age, infrastructure, contact_quality]);

        ScoreBreakdown {
            industry,
            wealth,
            company_age,
            infrastructure,
            contact_quality,
            total,
            tier: self.market.tier_for_score(total),
            age_scored: age.is_some(),
        }
    }
}

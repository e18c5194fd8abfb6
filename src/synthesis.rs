/// Message synthesis for qualifying tiers.
///
/// The fast path is deterministic template output (hook, tax argument, lead
/// description). The deep path hands a compact JSON context to an optional
/// narrative generator, time-boxed, and falls back to a template narrative.
use crate::errors::FetchError;
use crate::gateway_client::HttpGateway;
use crate::market_data::MarketData;
use crate::models::{
    CleanRecord, EnrichmentContext, LeadRecord, Messages, NarrativeSource, ScoreBreakdown,
    WealthTier,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Narrative plugin. Implementations receive the compact context built by
/// [`narrative_context`] and return a short outreach message.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, context: &Value) -> Result<String, FetchError>;
}

/// Text-generation service reached over HTTP: POSTs the context to
/// `/generate` and reads `{"message": "..."}`.
pub struct HttpNarrativeClient {
    gateway: HttpGateway,
}

impl HttpNarrativeClient {
    pub fn new(gateway: HttpGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl NarrativeGenerator for HttpNarrativeClient {
    fn name(&self) -> &str {
        self.gateway.name()
    }

    async fn generate(&self, context: &Value) -> Result<String, FetchError> {
        let response = self.gateway.post_json("/generate", context).await?;
        response
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .ok_or_else(|| FetchError::Decode("narrative response has no message".to_string()))
    }
}

/// Polish grouping: `14250.0` → `"14 250"`.
pub fn format_pln(amount: f64) -> String {
    let rounded = amount.max(0.0).round() as u64;
    let digits = rounded.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

pub struct MessageSynthesizer {
    market: Arc<MarketData>,
    narrative: Option<Arc<dyn NarrativeGenerator>>,
    narrative_timeout: Duration,
}

impl MessageSynthesizer {
    pub fn new(
        market: Arc<MarketData>,
        narrative: Option<Arc<dyn NarrativeGenerator>>,
        narrative_timeout: Duration,
    ) -> Self {
        Self {
            market,
            narrative,
            narrative_timeout,
        }
    }

    /// Deterministic messages. `narrative` stays empty until the deep path.
    pub fn fast_path(&self, record: &CleanRecord, context: &EnrichmentContext) -> Messages {
        Messages {
            sniper_hook: self.sniper_hook(record, context),
            tax_weapon: self.tax_weapon(context),
            lead_description: self.lead_description(record, context),
            narrative: None,
            narrative_source: None,
        }
    }

    /// Fills the narrative of an already synthesized lead. Never fails: a
    /// missing, slow, failing or panicking generator yields the template
    /// narrative.
    pub async fn deep_path(&self, lead: &mut LeadRecord) -> NarrativeSource {
        let generated = match &self.narrative {
            Some(generator) => self.generate(generator, lead).await,
            None => None,
        };

        match generated {
            Some(text) => {
                let messages = lead
                    .messages
                    .get_or_insert_with(|| self.fast_path(&lead.record, &lead.context));
                messages.narrative = Some(text);
                messages.narrative_source = Some(NarrativeSource::Generated);
                NarrativeSource::Generated
            }
            None => self.template_path(lead),
        }
    }

    /// Deterministic narrative from the fast-path messages.
    pub fn template_path(&self, lead: &mut LeadRecord) -> NarrativeSource {
        let messages = lead
            .messages
            .get_or_insert_with(|| self.fast_path(&lead.record, &lead.context));
        messages.narrative = Some(template_narrative(messages, &lead.context));
        messages.narrative_source = Some(NarrativeSource::Template);
        NarrativeSource::Template
    }

    /// One time-boxed generator call on its own task, so a panic inside the
    /// generator only costs this narrative.
    async fn generate(
        &self,
        generator: &Arc<dyn NarrativeGenerator>,
        lead: &LeadRecord,
    ) -> Option<String> {
        let payload = narrative_context(&self.market, &lead.record, &lead.context, &lead.score);
        let task = tokio::spawn({
            let generator = generator.clone();
            async move { generator.generate(&payload).await }
        });
        let abort = task.abort_handle();
        let row = lead.record.row;

        match tokio::time::timeout(self.narrative_timeout, task).await {
            Ok(Ok(Ok(text))) => Some(text),
            Ok(Ok(Err(e))) => {
                tracing::warn!(
                    "⚠️ Narrative generator {} failed for row {}: {}",
                    generator.name(),
                    row,
                    e
                );
                None
            }
            Ok(Err(e)) => {
                tracing::error!(
                    "❌ Narrative generator {} aborted for row {}: {}",
                    generator.name(),
                    row,
                    e
                );
                None
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    "⚠️ Narrative generator {} timed out after {:?} for row {}",
                    generator.name(),
                    self.narrative_timeout,
                    row
                );
                None
            }
        }
    }

    fn sniper_hook(&self, record: &CleanRecord, context: &EnrichmentContext) -> String {
        let profile = self.market.industry_profile(record.industry_code.as_deref());
        let benefit = context.tax.value.tax_benefit_annual;
        let distance = context.charger_distance_km();
        let city = display_city(record, context);

        let greeting = match &record.first_name {
            Some(name) => format!("Dzień dobry Panie/Pani {}!", name),
            None => "Dzień dobry!".to_string(),
        };

        let mut hook = match (profile.tier.as_str(), profile.tax_benefit_focus) {
            ("S", true) => {
                let mut h = format!(
                    "{} {}. W przypadku Pana/Pani firmy to {} PLN rocznie.",
                    greeting,
                    profile.hook_angle,
                    format_pln(benefit)
                );
                if let Some(d) = distance.filter(|d| *d < 10.0) {
                    h.push_str(&format!(
                        " A najbliższa ładowarka jest tylko {:.1} km od {}.",
                        d, city
                    ));
                }
                h
            }
            ("A", _) => {
                let mut h = format!("{} {}.", greeting, profile.hook_angle);
                if benefit > 0.0 {
                    h.push_str(&format!(
                        " Konkretnie: {} PLN oszczędności rocznie.",
                        format_pln(benefit)
                    ));
                }
                if let Some(d) = distance.filter(|d| *d < 15.0) {
                    h.push_str(&format!(" Plus ładowarka {:.1} km od biura.", d));
                }
                h
            }
            _ => {
                let mut h = format!(
                    "{} Chciałbym porozmawiać o oszczędnościach dla Pana/Pani firmy.",
                    greeting
                );
                if benefit > 0.0 {
                    h.push_str(&format!(
                        " Auto elektryczne może obniżyć koszty firmowe o {} PLN rocznie.",
                        format_pln(benefit)
                    ));
                }
                h
            }
        };

        if let Some(region) = &context.regional.value {
            if profile.tier == "S" {
                hook.push_str(&format!(
                    " W woj. {} właśnie kończy się leasing {} aut premium.",
                    region.voivodeship.to_lowercase(),
                    format_pln(region.premium_registrations as f64)
                ));
            }
        }
        hook
    }

    fn tax_weapon(&self, context: &EnrichmentContext) -> String {
        let tax = &context.tax.value;
        let params = &self.market.tax;
        format!(
            "OSZCZĘDNOŚĆ PODATKOWA: do {} PLN/rok ({:.0}% stawka) | EV: pełna amortyzacja do {} PLN | Spalinowe: tylko do {} PLN | Dotacja: {} PLN | Paliwo vs prąd: {} PLN/rok",
            format_pln(tax.tax_benefit_annual),
            tax.tax_rate * 100.0,
            format_pln(params.ev_depreciation_limit),
            format_pln(params.ice_depreciation_limit),
            format_pln(tax.subsidy_amount),
            format_pln(tax.operating_savings_annual),
        )
    }

    fn lead_description(&self, record: &CleanRecord, context: &EnrichmentContext) -> String {
        let profile = self.market.industry_profile(record.industry_code.as_deref());
        let mut insights = Vec::new();

        match context.charger_distance_km() {
            Some(d) if d < 5.0 => insights.push(format!("ładowarka {:.1}km (doskonały dostęp)", d)),
            Some(d) if d < 10.0 => insights.push(format!("ładowarka {:.1}km", d)),
            Some(d) if d < 20.0 => insights.push(format!("ładowarka {:.1}km (akceptowalne)", d)),
            _ => {}
        }

        let renewal = &context.renewal.value;
        if let Some(age) = renewal.age_years {
            if renewal.band == "RENEWAL_WINDOW" {
                insights.push(format!("firma {:.0} lat (cykl wymiany)", age));
            } else if age >= 1.0 {
                insights.push(format!("firma {:.0} lat", age));
            }
        }

        match context.wealth.value.tier {
            WealthTier::Premium => insights.push("lokalizacja premium".to_string()),
            WealthTier::High => insights.push("dobra lokalizacja".to_string()),
            _ => {}
        }

        if let Some(region) = &context.regional.value {
            insights.push(format!(
                "{} aut premium po leasingu w regionie",
                format_pln(region.premium_registrations as f64)
            ));
        }

        let mut description = format!("{} z {}", profile.name, display_city(record, context));
        if !insights.is_empty() {
            description.push_str(", ");
            description.push_str(&insights.join(", "));
        }
        description
    }
}

fn display_city<'a>(record: &'a CleanRecord, context: &'a EnrichmentContext) -> &'a str {
    context
        .wealth
        .value
        .resolved_city
        .as_deref()
        .or(record.city.as_deref())
        .unwrap_or("regionu")
}

fn template_narrative(messages: &Messages, context: &EnrichmentContext) -> String {
    let mut text = messages.sniper_hook.clone();
    if context.renewal.value.band == "RENEWAL_WINDOW" {
        text.push_str(" To dobry moment: firma jest w typowym oknie wymiany floty.");
    }
    text.push_str(&format!(
        " Dotacja {} PLN i {} PLN rocznie mniej na paliwie.",
        format_pln(context.tax.value.subsidy_amount),
        format_pln(context.tax.value.operating_savings_annual)
    ));
    text
}

/// Compact context handed to the narrative generator. No contact data.
pub fn narrative_context(
    market: &MarketData,
    record: &CleanRecord,
    context: &EnrichmentContext,
    score: &ScoreBreakdown,
) -> Value {
    let profile = market.industry_profile(record.industry_code.as_deref());
    json!({
        "tier": score.tier.as_str(),
        "totalScore": score.total,
        "firstName": record.first_name,
        "industry": {
            "code": record.industry_code,
            "name": profile.full_name,
            "hookAngle": profile.hook_angle,
        },
        "wealth": {
            "tier": context.wealth.value.tier.as_str(),
            "city": context.wealth.value.resolved_city,
            "signal": context.wealth.value.signal,
        },
        "enrichment": {
            "chargerDistanceKm": context.charger_distance_km(),
            "taxBenefitAnnual": context.tax.value.tax_benefit_annual,
            "subsidyAmount": context.tax.value.subsidy_amount,
            "operatingSavingsAnnual": context.tax.value.operating_savings_annual,
            "renewalBand": context.renewal.value.band,
            "regionalPremiumRegistrations": context
                .regional
                .value
                .as_ref()
                .map(|r| r.premium_registrations),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::{compute_tax_benefit, renewal_layer, wealth_layer};
    use crate::models::{ChargerProximity, SourceConfidence, Sourced, Tier};
    use chrono::NaiveDate;

    struct FixedNarrative(Result<String, FetchError>);

    #[async_trait]
    impl NarrativeGenerator for FixedNarrative {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _context: &Value) -> Result<String, FetchError> {
            self.0.clone()
        }
    }

    struct SlowNarrative;

    #[async_trait]
    impl NarrativeGenerator for SlowNarrative {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _context: &Value) -> Result<String, FetchError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    fn lead(market: &MarketData) -> LeadRecord {
        let record = CleanRecord {
            first_name: Some("Anna".into()),
            city: Some("Kraków".into()),
            industry_code: Some("6910Z".into()),
            registration_date: NaiveDate::from_ymd_opt(2021, 2, 1),
            ..Default::default()
        };
        let context = EnrichmentContext {
            wealth: wealth_layer(market, &record),
            infrastructure: Sourced::new(
                Some(ChargerProximity {
                    distance_km: 3.24,
                    station: "Test".into(),
                    power_kw: 150.0,
                }),
                SourceConfidence::Live,
            ),
            tax: Sourced::new(
                compute_tax_benefit(&market.tax, 0.32, 6.05, false),
                SourceConfidence::Live,
            ),
            renewal: renewal_layer(
                market,
                record.registration_date,
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            ),
            regional: Sourced::new(None, SourceConfidence::Heuristic),
        };
        LeadRecord {
            record,
            context,
            score: ScoreBreakdown {
                industry: 30,
                wealth: 20,
                company_age: 20,
                infrastructure: 15,
                contact_quality: 5,
                total: 90,
                tier: Tier::S,
                age_scored: true,
            },
            messages: None,
        }
    }

    fn synthesizer(
        narrative: Option<Arc<dyn NarrativeGenerator>>,
    ) -> (Arc<MarketData>, MessageSynthesizer) {
        let market = Arc::new(MarketData::bundled().unwrap());
        let synth = MessageSynthesizer::new(market.clone(), narrative, Duration::from_millis(100));
        (market, synth)
    }

    struct PanickingNarrative;

    #[async_trait]
    impl NarrativeGenerator for PanickingNarrative {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn generate(&self, _context: &Value) -> Result<String, FetchError> {
            panic!("generator bug")
        }
    }

    #[test]
    fn test_format_pln() {
        assert_eq!(format_pln(14_250.0), "14 250");
        assert_eq!(format_pln(999.4), "999");
        assert_eq!(format_pln(1_000_000.0), "1 000 000");
        assert_eq!(format_pln(-5.0), "0");
    }

    #[test]
    fn test_fast_path_messages() {
        let (market, synth) = synthesizer(None);
        let lead = lead(&market);
        let messages = synth.fast_path(&lead.record, &lead.context);

        assert!(messages.sniper_hook.starts_with("Dzień dobry Panie/Pani Anna!"));
        assert!(messages.sniper_hook.contains("24 000 PLN"));
        assert!(messages.sniper_hook.contains("3.2 km od Kraków"));
        assert!(messages.tax_weapon.contains("(32% stawka)"));
        assert!(messages.lead_description.starts_with("Prawnik z Kraków"));
        assert!(messages.lead_description.contains("cykl wymiany"));
        assert!(messages.narrative.is_none());
    }

    #[tokio::test]
    async fn test_deep_path_uses_generator() {
        let generator: Arc<dyn NarrativeGenerator> =
            Arc::new(FixedNarrative(Ok("Spersonalizowana wiadomość".to_string())));
        let (market, synth) = synthesizer(Some(generator));
        let mut lead = lead(&market);

        let source = synth.deep_path(&mut lead).await;
        assert_eq!(source, NarrativeSource::Generated);
        let messages = lead.messages.unwrap();
        assert_eq!(messages.narrative.as_deref(), Some("Spersonalizowana wiadomość"));
    }

    #[tokio::test]
    async fn test_failing_generator_falls_back_to_template() {
        let generator: Arc<dyn NarrativeGenerator> =
            Arc::new(FixedNarrative(Err(FetchError::Transient("down".into()))));
        let (market, synth) = synthesizer(Some(generator));
        let mut lead = lead(&market);

        assert_eq!(synth.deep_path(&mut lead).await, NarrativeSource::Template);
        let messages = lead.messages.unwrap();
        assert!(messages.narrative.unwrap().contains("Dotacja 27 000 PLN"));
    }

    #[tokio::test]
    async fn test_slow_generator_is_time_boxed() {
        let (market, synth) = synthesizer(Some(Arc::new(SlowNarrative)));
        let mut lead = lead(&market);
        assert_eq!(synth.deep_path(&mut lead).await, NarrativeSource::Template);
    }

    #[tokio::test]
    async fn test_panicking_generator_keeps_the_lead() {
        let (market, synth) = synthesizer(Some(Arc::new(PanickingNarrative)));
        let mut lead = lead(&market);

        assert_eq!(synth.deep_path(&mut lead).await, NarrativeSource::Template);
        let messages = lead.messages.unwrap();
        assert_eq!(messages.narrative_source, Some(NarrativeSource::Template));
        assert!(messages.narrative.is_some());
    }

    #[test]
    fn test_narrative_context_has_no_contact_data() {
        let market = MarketData::bundled().unwrap();
        let mut lead = lead(&market);
        lead.record.phone = Some("48501234567".into());
        let ctx = narrative_context(&market, &lead.record, &lead.context, &lead.score);
        assert_eq!(ctx["tier"], "S");
        assert_eq!(ctx["industry"]["code"], "6910Z");
        assert!(!ctx.to_string().contains("48501234567"));
    }
}

/// Record validation and normalization.
///
/// Every function here is pure: a record's output depends only on its own
/// cells, so chunks can be refined concurrently without shared state.
use crate::config::Config;
use crate::errors::{PipelineError, ResultExt, ValidationError};
use crate::models::{CleanRecord, RawRecord, RejectionReason};
use chrono::NaiveDate;
use phonenumber::country::Id as CountryId;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

/// Logical input fields recognized by the refinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TaxId,
    Phone,
    Email,
    FirstName,
    LastName,
    CompanyName,
    IndustryCode,
    City,
    PostalCode,
    Street,
    Website,
    LegalForm,
    RegistrationDate,
    FamilyStatus,
}

impl Field {
    pub const ALL: [Field; 14] = [
        Field::TaxId,
        Field::Phone,
        Field::Email,
        Field::FirstName,
        Field::LastName,
        Field::CompanyName,
        Field::IndustryCode,
        Field::City,
        Field::PostalCode,
        Field::Street,
        Field::Website,
        Field::LegalForm,
        Field::RegistrationDate,
        Field::FamilyStatus,
    ];

    fn default_synonyms(&self) -> &'static [&'static str] {
        match self {
            Field::TaxId => &["nip", "numer_nip", "tax_id", "taxid"],
            Field::Phone => &["phone", "telefon", "tel", "phone_number", "numer_telefonu"],
            Field::Email => &["email", "e-mail", "mail", "adres_email"],
            Field::FirstName => &["first_name", "imie", "imię", "firstname"],
            Field::LastName => &["last_name", "nazwisko", "lastname"],
            Field::CompanyName => &[
                "company_name",
                "nazwa",
                "firma",
                "nazwaskrocona",
                "nazwapodmiotu",
                "name",
            ],
            Field::IndustryCode => &["pkd", "pkd_code", "pkdglowny", "pkd_glowny", "glownykodpkd"],
            Field::City => &["city", "miasto", "miejscowosc", "miejscowość"],
            Field::PostalCode => &["postal_code", "zip_code", "kod_pocztowy", "kodpocztowy", "zip"],
            Field::Street => &["street", "ulica", "adres", "address"],
            Field::Website => &["www", "website", "strona_www", "adresstronyinternetowej"],
            Field::LegalForm => &["legal_form", "forma_prawna", "formaprawna", "form"],
            Field::RegistrationDate => &[
                "start_date",
                "data_rozpoczecia",
                "datarozpoczeciadzialalnosci",
                "data_start",
                "registration_date",
            ],
            Field::FamilyStatus => &["karta_duzej_rodziny", "family_card", "family_status", "kdr"],
        }
    }
}

/// Synonym table, resolved against a header row once per input file.
#[derive(Debug, Clone)]
pub struct ColumnSynonyms {
    table: BTreeMap<Field, Vec<String>>,
}

impl Default for ColumnSynonyms {
    fn default() -> Self {
        let table = Field::ALL
            .iter()
            .map(|f| {
                let names = f.default_synonyms().iter().map(|s| s.to_string()).collect();
                (*f, names)
            })
            .collect();
        Self { table }
    }
}

impl ColumnSynonyms {
    /// Bundled table with per-field replacements from a JSON object such as
    /// `{"phone": ["tel_kom", "telefon"]}`.
    pub fn with_overrides(raw_json: &str) -> Result<Self, PipelineError> {
        let overrides: BTreeMap<Field, Vec<String>> = serde_json::from_str(raw_json)?;
        let mut synonyms = Self::default();
        for (field, names) in overrides {
            synonyms.table.insert(field, names);
        }
        Ok(synonyms)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading column synonyms {}", path.display()))?;
                Self::with_overrides(&raw)
                    .with_context(|| format!("parsing column synonyms {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn names(&self, field: Field) -> &[String] {
        self.table.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Field to column index for one input file.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    indices: BTreeMap<Field, usize>,
}

impl ColumnMapping {
    /// Case-insensitive match; the first synonym present wins. Unrecognized
    /// columns are ignored.
    pub fn resolve<S: AsRef<str>>(headers: &[S], synonyms: &ColumnSynonyms) -> Self {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.as_ref().trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();

        let mut indices = BTreeMap::new();
        for field in Field::ALL {
            let found = synonyms.names(field).iter().find_map(|name| {
                let name = name.to_lowercase();
                normalized.iter().position(|h| *h == name)
            });
            match found {
                Some(idx) => {
                    indices.insert(field, idx);
                }
                None => tracing::debug!("Column not found for field {:?}", field),
            }
        }

        tracing::info!(
            "✓ Column mapping resolved: {}/{} fields matched",
            indices.len(),
            Field::ALL.len()
        );

        Self { indices }
    }

    pub fn has(&self, field: Field) -> bool {
        self.indices.contains_key(&field)
    }

    /// Trimmed, non-empty cell for `field`.
    pub fn get<'a>(&self, field: Field, record: &'a RawRecord) -> Option<&'a str> {
        let idx = *self.indices.get(&field)?;
        record
            .cells
            .get(idx)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
    }
}

/// Required-field policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefineryPolicy {
    pub require_phone: bool,
    pub require_email: bool,
    pub reject_invalid_tax_id: bool,
}

impl Default for RefineryPolicy {
    fn default() -> Self {
        Self {
            require_phone: true,
            require_email: false,
            reject_invalid_tax_id: false,
        }
    }
}

impl From<&Config> for RefineryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            require_phone: config.require_phone,
            require_email: config.require_email,
            reject_invalid_tax_id: config.reject_invalid_tax_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Refinery {
    mapping: ColumnMapping,
    policy: RefineryPolicy,
}

impl Refinery {
    pub fn new(mapping: ColumnMapping, policy: RefineryPolicy) -> Self {
        if policy.require_phone && !mapping.has(Field::Phone) {
            tracing::warn!("⚠️ Phone is required but no phone column was recognized");
        }
        Self { mapping, policy }
    }

    /// Validates and normalizes one record, or names the policy that
    /// excluded it.
    pub fn clean(&self, raw: &RawRecord) -> Result<CleanRecord, RejectionReason> {
        let get = |field| self.mapping.get(field, raw);

        let (tax_id, tax_id_flagged) = match get(Field::TaxId) {
            None => (None, false),
            Some(value) => match validate_tax_id(value) {
                Ok(nip) => (Some(nip), false),
                Err(e) => {
                    if self.policy.reject_invalid_tax_id {
                        tracing::debug!("Row {} rejected: {}", raw.row, e);
                        return Err(RejectionReason::InvalidTaxId);
                    }
                    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
                    (Some(digits).filter(|d| !d.is_empty()), true)
                }
            },
        };

        let phone = match get(Field::Phone) {
            None if self.policy.require_phone => return Err(RejectionReason::MissingPhone),
            None => None,
            Some(value) => match normalize_phone(value) {
                Ok(phone) => Some(phone),
                Err(e) if self.policy.require_phone => {
                    tracing::debug!("Row {} rejected: {}", raw.row, e);
                    return Err(RejectionReason::InvalidPhone);
                }
                Err(_) => None,
            },
        };

        let email = get(Field::Email).and_then(normalize_email);
        if self.policy.require_email && email.is_none() {
            return Err(RejectionReason::MissingEmail);
        }

        Ok(CleanRecord {
            row: raw.row,
            tax_id,
            tax_id_flagged,
            phone,
            email,
            postal_code: get(Field::PostalCode).and_then(normalize_postal_code),
            city: get(Field::City).map(str::to_string),
            street: get(Field::Street).map(str::to_string),
            website: get(Field::Website).and_then(normalize_website),
            industry_code: get(Field::IndustryCode).and_then(normalize_industry_code),
            legal_form: get(Field::LegalForm).map(str::to_string),
            registration_date: get(Field::RegistrationDate).and_then(parse_date),
            first_name: get(Field::FirstName).map(str::to_string),
            last_name: get(Field::LastName).map(str::to_string),
            company_name: get(Field::CompanyName).map(str::to_string),
            family_status: get(Field::FamilyStatus).map_or(false, parse_flag),
        })
    }
}

const TAX_ID_WEIGHTS: [u32; 9] = [6, 5, 7, 2, 3, 4, 5, 6, 7];

/// Validates a 10-digit business identifier (NIP). An optional `PL` VAT
/// prefix and any non-digit separators are ignored.
///
/// The weighted sum of the first nine digits modulo 11 must equal the tenth
/// digit; a remainder of 10 never matches.
pub fn validate_tax_id(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let unprefixed = match trimmed.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("PL") => &trimmed[2..],
        _ => trimmed,
    };
    let digits: Vec<u32> = unprefixed.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.len() != 10 {
        return Err(ValidationError::InvalidTaxId(raw.to_string()));
    }

    let checksum = digits
        .iter()
        .zip(TAX_ID_WEIGHTS.iter())
        .map(|(d, w)| d * w)
        .sum::<u32>()
        % 11;

    if checksum != digits[9] {
        return Err(ValidationError::InvalidTaxId(raw.to_string()));
    }

    Ok(digits.iter().map(|d| char::from(b'0' + *d as u8)).collect())
}

/// Normalizes a Polish phone number to `48XXXXXXXXX`.
///
/// Accepts `+48`/`0048`/`048` prefixes, a bare `48` prefix or a bare
/// 9-digit national number. Canonical input comes back unchanged.
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    let national = match digits.len() {
        9 => digits.as_str(),
        11 if digits.starts_with("48") => &digits[2..],
        12 if digits.starts_with("048") => &digits[3..],
        13 if digits.starts_with("0048") => &digits[4..],
        _ => return Err(ValidationError::InvalidPhone(raw.to_string())),
    };

    let number = phonenumber::parse(Some(CountryId::PL), format!("+48{}", national))
        .map_err(|_| ValidationError::InvalidPhone(raw.to_string()))?;
    if !phonenumber::is_valid(&number) {
        return Err(ValidationError::InvalidPhone(raw.to_string()));
    }

    Ok(format!("48{}", national))
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$",
    )
    .expect("valid regex")
});

const FAKE_EMAIL_PATTERNS: [&str; 4] = ["999999", "111111", "000000", "123456789"];

/// Lower-cased structural validation. Invalid or placeholder addresses
/// become `None`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.len() < 5 {
        return None;
    }
    if let Some(pattern) = FAKE_EMAIL_PATTERNS.iter().find(|p| email.contains(*p)) {
        tracing::debug!("❌ Placeholder email (pattern '{}'): {}", pattern, email);
        return None;
    }
    EMAIL_RE.is_match(&email).then_some(email)
}

/// Five digits become `XX-XXX`; anything else is `None`.
pub fn normalize_postal_code(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (digits.len() == 5).then(|| format!("{}-{}", &digits[..2], &digits[2..]))
}

/// `69.10.Z` and `6910 z` both become `6910Z`.
pub fn normalize_industry_code(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!code.is_empty()).then_some(code)
}

fn normalize_website(raw: &str) -> Option<String> {
    let site = raw.trim().to_lowercase();
    (site.contains('.') && !site.contains(' ')).then_some(site)
}

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d", "%d/%m/%Y", "%Y%m%d",
];

/// Tries each supported encoding on the date part of the value (anything
/// after a `T` or a space is ignored).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.trim().split(['T', ' ']).next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "t" | "tak" | "yes" | "y" | "x"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tax_id_checksum() {
        assert_eq!(validate_tax_id("5260250274").unwrap(), "5260250274");
        assert_eq!(validate_tax_id("526-025-02-74").unwrap(), "5260250274");
        assert!(validate_tax_id("5260250275").is_err());
        assert!(validate_tax_id("526025027").is_err());
        assert!(validate_tax_id("52602502A4").is_err());
    }

    #[test]
    fn test_tax_id_separators_and_vat_prefix() {
        assert_eq!(validate_tax_id("526.025.02.74").unwrap(), "5260250274");
        assert_eq!(validate_tax_id("PL5260250274").unwrap(), "5260250274");
        assert_eq!(validate_tax_id("pl 526-025-02-74").unwrap(), "5260250274");
        assert_eq!(validate_tax_id(" 526/025/02/74 ").unwrap(), "5260250274");
        assert!(validate_tax_id("PL5260250275").is_err());
    }

    #[test]
    fn test_phone_prefixes() {
        assert_eq!(normalize_phone("+48 501 234 567").unwrap(), "48501234567");
        assert_eq!(normalize_phone("0048501234567").unwrap(), "48501234567");
        assert_eq!(normalize_phone("048501234567").unwrap(), "48501234567");
        assert_eq!(normalize_phone("501-234-567").unwrap(), "48501234567");
        assert_eq!(normalize_phone("48501234567").unwrap(), "48501234567");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("bad").is_err());
    }

    #[test]
    fn test_email_normalization() {
        assert_eq!(
            normalize_email("  Jan.Kowalski@Kancelaria.PL "),
            Some("jan.kowalski@kancelaria.pl".to_string())
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("111111@gmail.com"), None);
        assert_eq!(normalize_email("a@b"), None);
    }

    #[test]
    fn test_postal_code() {
        assert_eq!(normalize_postal_code("00950"), Some("00-950".to_string()));
        assert_eq!(normalize_postal_code("40-001"), Some("40-001".to_string()));
        assert_eq!(normalize_postal_code("4000"), None);
    }

    #[test]
    fn test_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2021, 3, 15);
        for raw in [
            "2021-03-15",
            "15-03-2021",
            "15.03.2021",
            "2021/03/15",
            "15/03/2021",
            "20210315",
            "2021-03-15T00:00:00",
            "2021-03-15 10:00",
        ] {
            assert_eq!(parse_date(raw), expected, "format {}", raw);
        }
        assert_eq!(parse_date("wczoraj"), None);
    }

    #[test]
    fn test_industry_code_normalization() {
        assert_eq!(normalize_industry_code("69.10.Z"), Some("6910Z".to_string()));
        assert_eq!(normalize_industry_code("6910 z"), Some("6910Z".to_string()));
        assert_eq!(normalize_industry_code(" . "), None);
    }

    #[test]
    fn test_mapping_is_case_insensitive_and_ignores_unknown() {
        let headers = ["\u{feff}NIP", "Telefon", "Kolumna_X", "KodPocztowy"];
        let mapping = ColumnMapping::resolve(&headers, &ColumnSynonyms::default());
        assert!(mapping.has(Field::TaxId));
        assert!(mapping.has(Field::Phone));
        assert!(mapping.has(Field::PostalCode));
        assert!(!mapping.has(Field::Email));
    }

    #[test]
    fn test_synonym_override_replaces_field() {
        let synonyms = ColumnSynonyms::with_overrides(r#"{"phone": ["tel_kom"]}"#).unwrap();
        assert_eq!(synonyms.names(Field::Phone), ["tel_kom".to_string()]);
        assert!(!synonyms.names(Field::Email).is_empty());
        assert!(ColumnSynonyms::with_overrides(r#"{"shoe_size": []}"#).is_err());
    }

    #[test]
    fn test_family_flag() {
        assert!(parse_flag("TAK"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("nie"));
    }
}

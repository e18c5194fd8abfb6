/// Refinery integration tests: header mapping, policies and normalization
/// over whole records.
use lead_sniper::models::{RawRecord, RejectionReason};
use lead_sniper::refinery::{ColumnMapping, ColumnSynonyms, Field, Refinery, RefineryPolicy};

const VALID_NIP: &str = "5260250274";

fn headers() -> Vec<&'static str> {
    vec![
        "\u{feff}NIP",
        "Telefon",
        "E-mail",
        "Imię",
        "Nazwisko",
        "Nazwa",
        "PKD",
        "Miejscowość",
        "Kod_Pocztowy",
        "Forma_Prawna",
        "Data_Rozpoczecia",
        "Karta_Duzej_Rodziny",
        "Ignored Column",
    ]
}

fn raw(row: usize, cells: &[&str]) -> RawRecord {
    RawRecord {
        row,
        cells: cells.iter().map(|c| c.to_string()).collect(),
    }
}

fn refinery(policy: RefineryPolicy) -> Refinery {
    let mapping = ColumnMapping::resolve(&headers(), &ColumnSynonyms::default());
    Refinery::new(mapping, policy)
}

fn full_row(nip: &str, phone: &str, email: &str) -> RawRecord {
    raw(
        1,
        &[
            nip,
            phone,
            email,
            "Jan",
            "Kowalski",
            "Kancelaria Kowalski",
            "69.10.Z",
            "Warszawa",
            "00950",
            "SPÓŁKA CYWILNA",
            "2020-03-15",
            "TAK",
            "whatever",
        ],
    )
}

#[test]
fn test_headers_resolve_case_insensitively_with_bom() {
    let mapping = ColumnMapping::resolve(&headers(), &ColumnSynonyms::default());
    for field in [
        Field::TaxId,
        Field::Phone,
        Field::Email,
        Field::FirstName,
        Field::City,
        Field::PostalCode,
        Field::FamilyStatus,
    ] {
        assert!(mapping.has(field), "{:?} not mapped", field);
    }
    assert!(!mapping.has(Field::Website));
}

#[test]
fn test_full_row_is_normalized() {
    let record = refinery(RefineryPolicy::default())
        .clean(&full_row(VALID_NIP, "+48 501 234 567", "Jan@Kancelaria.PL"))
        .unwrap();

    assert_eq!(record.tax_id.as_deref(), Some(VALID_NIP));
    assert!(!record.tax_id_flagged);
    assert_eq!(record.phone.as_deref(), Some("48501234567"));
    assert_eq!(record.email.as_deref(), Some("jan@kancelaria.pl"));
    assert_eq!(record.postal_code.as_deref(), Some("00-950"));
    assert_eq!(record.industry_code.as_deref(), Some("6910Z"));
    assert_eq!(record.city.as_deref(), Some("Warszawa"));
    assert!(record.registration_date.is_some());
    assert!(record.family_status);
}

#[test]
fn test_missing_phone_is_rejected_when_required() {
    let result = refinery(RefineryPolicy::default()).clean(&full_row(VALID_NIP, "", "a@b.pl"));
    assert_eq!(result.unwrap_err(), RejectionReason::MissingPhone);
    assert_eq!(RejectionReason::MissingPhone.label(), "missing phone");
}

#[test]
fn test_invalid_phone_is_rejected_when_required() {
    let result = refinery(RefineryPolicy::default()).clean(&full_row(VALID_NIP, "12345", "a@b.pl"));
    assert_eq!(result.unwrap_err(), RejectionReason::InvalidPhone);
}

#[test]
fn test_phone_optional_keeps_record() {
    let policy = RefineryPolicy {
        require_phone: false,
        ..RefineryPolicy::default()
    };
    let record = refinery(policy).clean(&full_row(VALID_NIP, "", "a@b.pl")).unwrap();
    assert!(record.phone.is_none());
}

#[test]
fn test_email_policy() {
    let policy = RefineryPolicy {
        require_email: true,
        ..RefineryPolicy::default()
    };
    let result = refinery(policy).clean(&full_row(VALID_NIP, "501234567", "test111111@x.pl"));
    assert_eq!(result.unwrap_err(), RejectionReason::MissingEmail);
}

#[test]
fn test_bad_checksum_is_flagged_by_default() {
    let record = refinery(RefineryPolicy::default())
        .clean(&full_row("526-025-02-75", "501234567", ""))
        .unwrap();
    assert!(record.tax_id_flagged);
    assert_eq!(record.tax_id.as_deref(), Some("5260250275"));
}

#[test]
fn test_bad_checksum_is_rejected_when_configured() {
    let policy = RefineryPolicy {
        reject_invalid_tax_id: true,
        ..RefineryPolicy::default()
    };
    let result = refinery(policy).clean(&full_row("5260250275", "501234567", ""));
    assert_eq!(result.unwrap_err(), RejectionReason::InvalidTaxId);
}

#[test]
fn test_vat_prefixed_and_dotted_tax_ids_are_accepted() {
    let policy = RefineryPolicy {
        reject_invalid_tax_id: true,
        ..RefineryPolicy::default()
    };
    for raw_nip in ["PL5260250274", "526.025.02.74", "PL 526-025-02-74"] {
        let record = refinery(policy)
            .clean(&full_row(raw_nip, "501234567", ""))
            .unwrap();
        assert_eq!(record.tax_id.as_deref(), Some(VALID_NIP), "{}", raw_nip);
        assert!(!record.tax_id_flagged, "{}", raw_nip);
    }
}

#[test]
fn test_short_row_is_tolerated() {
    let record = refinery(RefineryPolicy::default())
        .clean(&raw(7, &[VALID_NIP, "501234567"]))
        .unwrap();
    assert_eq!(record.row, 7);
    assert!(record.city.is_none());
}

#[test]
fn test_synonym_override() {
    let synonyms = ColumnSynonyms::with_overrides(r#"{"phone": ["tel_kom"]}"#).unwrap();
    let mapping = ColumnMapping::resolve(&["NIP", "TEL_KOM", "Telefon"], &synonyms);
    let refinery = Refinery::new(mapping, RefineryPolicy::default());

    let record = refinery
        .clean(&raw(1, &[VALID_NIP, "601 234 567", "garbage"]))
        .unwrap();
    assert_eq!(record.phone.as_deref(), Some("48601234567"));
}

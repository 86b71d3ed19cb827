//! Canonical identifier grammar (§6): 8 dash-separated segments
//! `VV-G-LLL-SSSS-T-YYMM-C-XX`. Context entities always use entity type `P`
//! (Person) — contexts are synthetic persons, never a separate entity code
//! (§4.D), including for lifecycle derivatives (supernova/fission/derivative/
//! suspension), which stay Person-type with a `lifecycle` tag in metadata.

use chrono::{Datelike, Utc};
use rand::Rng;

pub const ENTITY_TYPE_PERSON: char = 'P';

#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    #[error("malformed identifier: {0}")]
    Malformed(String),
}

/// Validate that `id` conforms to the 8-segment grammar.
pub fn validate(id: &str) -> Result<(), IdentifierError> {
    let segments: Vec<&str> = id.split('-').collect();
    if segments.len() != 8 {
        return Err(IdentifierError::Malformed(format!(
            "expected 8 dash-separated segments, got {}",
            segments.len()
        )));
    }
    let [vv, g, lll, ssss, t, yymm, c, xx] = segments[..] else {
        unreachable!("length checked above");
    };
    let checks: [(&str, &str); 8] = [
        ("VV", vv), ("G", g), ("LLL", lll), ("SSSS", ssss),
        ("T", t), ("YYMM", yymm), ("C", c), ("XX", xx),
    ];
    for (name, value) in checks {
        if value.is_empty() {
            return Err(IdentifierError::Malformed(format!("segment {name} is empty")));
        }
    }
    if !matches!(t, "P" | "L" | "T" | "E" | "A") {
        return Err(IdentifierError::Malformed(format!(
            "entity type segment must be one of P,L,T,E,A, got {t}"
        )));
    }
    if yymm.len() != 4 || !yymm.chars().all(|c| c.is_ascii_digit()) {
        return Err(IdentifierError::Malformed(format!(
            "YYMM segment must be 4 digits, got {yymm}"
        )));
    }
    Ok(())
}

/// Generate a fallback local identifier conforming to the grammar when the
/// minting service is unavailable (§4.D `createContext`). The entity is then
/// marked `unsigned=true` so it can be re-minted later.
pub fn generate_fallback(entity_type: char) -> String {
    let mut rng = rand::thread_rng();
    let now = Utc::now();
    let yymm = format!("{:02}{:02}", now.year() % 100, now.month());
    let rand_segment = |len: usize| -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        (0..len)
            .map(|_| {
                let idx = rng.gen_range(0..ALPHABET.len());
                ALPHABET[idx] as char
            })
            .collect()
    };
    format!(
        "FB-{}-{}-{}-{}-{}-{}-{}",
        rand_segment(1),
        rand_segment(3),
        rand_segment(4),
        entity_type,
        yymm,
        rand_segment(1),
        rand_segment(2),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_well_formed_identifier() {
        assert!(validate("CH-1-ABC-1234-P-2601-1-XY").is_ok());
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(validate("CH-1-ABC-P-2601").is_err());
    }

    #[test]
    fn rejects_bad_entity_type() {
        assert!(validate("CH-1-ABC-1234-Z-2601-1-XY").is_err());
    }

    #[test]
    fn fallback_ids_conform_to_grammar() {
        let id = generate_fallback(ENTITY_TYPE_PERSON);
        validate(&id).expect("fallback identifier must conform to the grammar");
        assert!(id.contains('P'));
    }
}

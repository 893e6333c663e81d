//! Region label and count codecs.
//!
//! Both directions are strict: a label that does not carry a parenthesized UF code
//! and is not an exact IBGE numeric code is an error, never a guess.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::PipelineError;

static PARENTHESIZED_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([A-Z]{2})\)").expect("static regex"));

static REGION_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FederativeUnit {
    pub ibge_code: u8,
    pub uf: &'static str,
    pub name: &'static str,
}

const fn unit(ibge_code: u8, uf: &'static str, name: &'static str) -> FederativeUnit {
    FederativeUnit { ibge_code, uf, name }
}

/// The 26 states plus the federal district, keyed by IBGE code.
pub const FEDERATIVE_UNITS: [FederativeUnit; 27] = [
    unit(11, "RO", "Rondônia"),
    unit(12, "AC", "Acre"),
    unit(13, "AM", "Amazonas"),
    unit(14, "RR", "Roraima"),
    unit(15, "PA", "Pará"),
    unit(16, "AP", "Amapá"),
    unit(17, "TO", "Tocantins"),
    unit(21, "MA", "Maranhão"),
    unit(22, "PI", "Piauí"),
    unit(23, "CE", "Ceará"),
    unit(24, "RN", "Rio Grande do Norte"),
    unit(25, "PB", "Paraíba"),
    unit(26, "PE", "Pernambuco"),
    unit(27, "AL", "Alagoas"),
    unit(28, "SE", "Sergipe"),
    unit(29, "BA", "Bahia"),
    unit(31, "MG", "Minas Gerais"),
    unit(32, "ES", "Espírito Santo"),
    unit(33, "RJ", "Rio de Janeiro"),
    unit(35, "SP", "São Paulo"),
    unit(41, "PR", "Paraná"),
    unit(42, "SC", "Santa Catarina"),
    unit(43, "RS", "Rio Grande do Sul"),
    unit(50, "MS", "Mato Grosso do Sul"),
    unit(51, "MT", "Mato Grosso"),
    unit(52, "GO", "Goiás"),
    unit(53, "DF", "Distrito Federal"),
];

pub const FEDERATIVE_UNIT_COUNT: usize = FEDERATIVE_UNITS.len();

pub fn unit_by_ibge_code(code: u8) -> Option<&'static FederativeUnit> {
    FEDERATIVE_UNITS.iter().find(|u| u.ibge_code == code)
}

pub fn is_region_code(code: &str) -> bool {
    REGION_CODE.is_match(code)
}

/// Resolve a free-text region label to its two-letter code.
pub fn to_region_code(label: &str) -> Result<String, PipelineError> {
    let trimmed = label.trim();
    if let Some(caps) = PARENTHESIZED_CODE.captures(trimmed) {
        return Ok(caps[1].to_string());
    }
    if trimmed.len() == 2 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Some(found) = trimmed.parse::<u8>().ok().and_then(unit_by_ibge_code) {
            return Ok(found.uf.to_string());
        }
    }
    Err(PipelineError::UnresolvableRegion(label.to_string()))
}

/// Strip every non-digit character and parse what is left. An empty remainder is zero.
pub fn to_integer(text: &str) -> Result<i64, PipelineError> {
    let digits = text.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse::<i64>()
        .map_err(|_| PipelineError::UnparsableNumber(text.to_string()))
}

/// Integer view of a JSON cell. Strings go through [`to_integer`]; numbers must be
/// integral. Sign is preserved so that the validator can reject negatives.
pub fn json_to_integer(value: &JsonValue) -> Result<i64, PipelineError> {
    match value {
        JsonValue::String(text) => to_integer(text),
        JsonValue::Number(number) => {
            if let Some(v) = number.as_i64() {
                return Ok(v);
            }
            match number.as_f64() {
                Some(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                    Ok(v as i64)
                }
                _ => Err(PipelineError::UnparsableNumber(number.to_string())),
            }
        }
        other => Err(PipelineError::UnparsableNumber(other.to_string())),
    }
}

/// Region label view of a JSON cell; numeric ids are looked up in the IBGE table.
pub fn json_to_region_code(value: &JsonValue) -> Result<String, PipelineError> {
    match value {
        JsonValue::String(text) => to_region_code(text),
        JsonValue::Number(number) => to_region_code(&number.to_string()),
        other => Err(PipelineError::UnresolvableRegion(other.to_string())),
    }
}

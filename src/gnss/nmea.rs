//! # NMEA 0183 Sentences
//!
//! Just enough NMEA parsing to gate and timestamp the log: checksum
//! validation, sentence type extraction and the RMC fields that carry fix
//! status, date and time.
//!
//! ## Sentence Structure
//!
//! ```text
//! $GPRMC,093000.00,A,5107.0017737,N,11402.3291611,W,0.08,,010324,,,A*5B
//! | |   |                                                           |
//! | |   fields (comma separated)                                    checksum
//! | sentence type
//! talker
//! ```

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{LoggerError, Result};

/// XOR of every byte between `$` and `*`
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Check framing and checksum of one sentence
///
/// # Arguments
///
/// * `line` - Sentence without line terminator
///
/// # Returns
///
/// * `Result<&str>` - The body between `$` and `*`
///
/// # Errors
///
/// Returns `Gnss` if the leading `$` or the `*hh` checksum is missing, or if
/// the checksum does not match.
pub fn validate(line: &str) -> Result<&str> {
    let rest = line
        .strip_prefix('$')
        .ok_or_else(|| gnss_err(format!("missing '$' in {:?}", line)))?;
    let (body, hex) = rest
        .rsplit_once('*')
        .ok_or_else(|| gnss_err(format!("missing checksum in {:?}", line)))?;

    let expected = u8::from_str_radix(hex, 16)
        .map_err(|_| gnss_err(format!("bad checksum field {:?}", hex)))?;
    let actual = checksum(body);
    if actual != expected {
        return Err(gnss_err(format!(
            "checksum mismatch: expected 0x{:02X}, got 0x{:02X}",
            expected, actual
        )));
    }
    Ok(body)
}

/// Sentence type without the talker, e.g. `RMC` for `GPRMC`
///
/// Proprietary sentences (`P...`) are returned whole.
pub fn sentence_type(body: &str) -> &str {
    let address = body.split(',').next().unwrap_or("");
    if address.starts_with('P') || address.len() <= 2 {
        address
    } else {
        address.get(2..).unwrap_or(address)
    }
}

/// Fields of interest from a recommended minimum (RMC) sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rmc {
    /// Status field is `A`
    pub valid: bool,
    /// UTC date and time, when both fields are present
    pub timestamp: Option<NaiveDateTime>,
}

/// Parse an RMC sentence body (as returned by [`validate`])
///
/// # Errors
///
/// Returns `Gnss` for non-RMC input, a short sentence, or a malformed
/// date/time field.
pub fn parse_rmc(body: &str) -> Result<Rmc> {
    let fields: Vec<&str> = body.split(',').collect();
    if sentence_type(body) != "RMC" {
        return Err(gnss_err(format!("not an RMC sentence: {}", fields[0])));
    }
    if fields.len() < 10 {
        return Err(gnss_err(format!("RMC sentence has {} fields", fields.len())));
    }

    let valid = fields[2] == "A";
    let timestamp = match (fields[1], fields[9]) {
        ("", _) | (_, "") => None,
        (time, date) => Some(NaiveDateTime::new(parse_date(date)?, parse_time(time)?)),
    };

    Ok(Rmc { valid, timestamp })
}

/// `ddmmyy`
fn parse_date(field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(field, "%d%m%y")
        .map_err(|e| gnss_err(format!("bad date {:?}: {}", field, e)))
}

/// `hhmmss` with optional fraction
fn parse_time(field: &str) -> Result<NaiveTime> {
    let whole = field.split('.').next().unwrap_or(field);
    NaiveTime::parse_from_str(whole, "%H%M%S")
        .map_err(|e| gnss_err(format!("bad time {:?}: {}", field, e)))
}

fn gnss_err(msg: String) -> LoggerError {
    LoggerError::Gnss(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RMC: &str = "$GPRMC,093000.00,A,5107.0017737,N,11402.3291611,W,0.08,,010324,,,A*5B";
    const RMC_NO_FIX: &str = "$GPRMC,093000.00,V,,,,,,,010324,,,N*73";
    const RMC_EMPTY: &str = "$GPRMC,,V,,,,,,,,,,N*53";
    const GSV: &str = "$GPGSV,3,1,12,01,40,083,46,02,17,308,41,12,07,344,39,14,22,228,45*7F";

    #[test]
    fn test_validate() {
        assert!(validate(RMC).is_ok());
        assert!(validate(GSV).is_ok());
        assert_eq!(validate("$GPGSV,1*48").unwrap(), "GPGSV,1");
    }

    #[test]
    fn test_validate_rejects_bad_checksum() {
        let corrupted = RMC.replace("093000", "093001");
        assert!(validate(&corrupted).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_framing() {
        assert!(validate("GPRMC,093000.00,A*5B").is_err());
        assert!(validate("$GPRMC,093000.00,A").is_err());
        assert!(validate("$GPRMC,093000.00,A*ZZ").is_err());
    }

    #[test]
    fn test_sentence_type() {
        assert_eq!(sentence_type("GPRMC,093000.00"), "RMC");
        assert_eq!(sentence_type("GNGSV,3,1"), "GSV");
        assert_eq!(sentence_type("PUBX,00"), "PUBX");
        assert_eq!(sentence_type(""), "");
    }

    #[test]
    fn test_parse_rmc_valid() {
        let rmc = parse_rmc(validate(RMC).unwrap()).unwrap();
        assert!(rmc.valid);
        assert_eq!(
            rmc.timestamp,
            NaiveDate::from_ymd_opt(2024, 3, 1).and_then(|d| d.and_hms_opt(9, 30, 0))
        );
    }

    #[test]
    fn test_parse_rmc_no_fix_still_has_time() {
        let rmc = parse_rmc(validate(RMC_NO_FIX).unwrap()).unwrap();
        assert!(!rmc.valid);
        assert!(rmc.timestamp.is_some());
    }

    #[test]
    fn test_parse_rmc_empty_fields() {
        let rmc = parse_rmc(validate(RMC_EMPTY).unwrap()).unwrap();
        assert!(!rmc.valid);
        assert_eq!(rmc.timestamp, None);
    }

    #[test]
    fn test_parse_rmc_rejects_other_sentences() {
        assert!(parse_rmc(validate(GSV).unwrap()).is_err());
        assert!(parse_rmc("GPRMC,093000.00,A").is_err());
        assert!(parse_rmc("GPRMC,093000.00,A,,,,,,,321399").is_err());
    }
}

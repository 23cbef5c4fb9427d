use chrono::{NaiveDate, NaiveDateTime};
use domain::sql_type::SqlColumnType;
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

const SAMPLE_LIMIT: usize = 5_000;
const NVARCHAR_MAX_LEN: usize = 255;

const BIT_ACCEPT: f64 = 0.90;
const NUMERIC_ACCEPT: f64 = 0.80;
const NVARCHAR_ACCEPT: f64 = 0.90;
const RESCUE_FLOOR: f64 = 0.50;

const BIT_VALUES: [&str; 8] = ["0", "1", "true", "false", "sim", "não", "yes", "no"];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];

lazy_static! {
    static ref DECIMAL_SHAPE: Regex = Regex::new(r"^[-+]?[0-9]*\.?[0-9]+([eE][-+]?[0-9]+)?$").expect("invalid decimal regex");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Candidate {
    Bit,
    Int,
    BigInt,
    Decimal,
    Date,
    DateTime,
    NVarChar,
}

impl Candidate {
    ///
    /// Candidates whose threshold is 0.80 are eligible for the rescue rule in step 2 of
    /// selection; bit and nvarchar share the stricter 0.90 bar and a low-confidence guess there
    /// is never rescued (a wrong boolean coercion is too costly - see DESIGN.md).
    ///
    fn rescuable(&self) -> bool {
        matches!(self, Candidate::Int | Candidate::BigInt | Candidate::Decimal | Candidate::Date | Candidate::DateTime)
    }

    fn threshold(&self) -> f64 {
        match self {
            Candidate::Bit => BIT_ACCEPT,
            Candidate::NVarChar => NVARCHAR_ACCEPT,
            _ => NUMERIC_ACCEPT,
        }
    }

    fn priority(&self) -> u8 {
        match self {
            Candidate::Bit => 1,
            Candidate::Int => 2,
            Candidate::BigInt => 3,
            Candidate::Decimal => 4,
            Candidate::Date => 5,
            Candidate::DateTime => 6,
            Candidate::NVarChar => 99,
        }
    }
}

struct Tally {
    candidate: Candidate,
    valid: usize,
    disqualified: bool, // the "every sample fits int -> reject bigint" veto.
}

impl Tally {
    fn reliability(&self, non_empty: usize) -> f64 {
        if self.disqualified || non_empty == 0 {
            0.0
        } else {
            self.valid as f64 / non_empty as f64
        }
    }
}

///
/// Infer the destination SQL type for one column from up to 5,000 sampled raw values.
///
pub fn infer_column_type(values: impl Iterator<Item = impl AsRef<str>>) -> SqlColumnType {
    let samples: Vec<String> = values.take(SAMPLE_LIMIT).map(|v| v.as_ref().to_string()).collect();
    let non_empty: Vec<&str> = samples.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();

    if non_empty.is_empty() {
        log::debug!("column has no non-empty samples, inferring nvarchar(255)");
        return SqlColumnType::nvarchar_255(false);
    }

    let mut bit = Tally { candidate: Candidate::Bit, valid: 0, disqualified: false };
    let mut int = Tally { candidate: Candidate::Int, valid: 0, disqualified: false };
    let mut bigint = Tally { candidate: Candidate::BigInt, valid: 0, disqualified: false };
    let mut decimal = Tally { candidate: Candidate::Decimal, valid: 0, disqualified: false };
    let mut date = Tally { candidate: Candidate::Date, valid: 0, disqualified: false };
    let mut datetime = Tally { candidate: Candidate::DateTime, valid: 0, disqualified: false };
    let mut nvarchar = Tally { candidate: Candidate::NVarChar, valid: 0, disqualified: false };

    let mut max_int_digits = 0usize;
    let mut max_frac_digits = 0usize;
    let mut max_len = 0usize;
    let mut bigint_all_fit_int = true;

    for value in &non_empty {
        max_len = max_len.max(value.len());

        let is_bit = is_bit(value);
        let is_int = is_int32(value);
        let is_big = is_int64(value);
        let is_dec = is_decimal(value);
        let is_dt_date = is_date(value);
        let is_dt_time = is_datetime(value);

        if is_bit {
            bit.valid += 1;
        }
        if is_int {
            int.valid += 1;
        }
        if is_big {
            bigint.valid += 1;
            if !is_int {
                bigint_all_fit_int = false;
            }
        }
        if is_dec {
            decimal.valid += 1;
            let (int_digits, frac_digits) = decimal_digits(value);
            max_int_digits = max_int_digits.max(int_digits);
            max_frac_digits = max_frac_digits.max(frac_digits);
        }
        if is_dt_date {
            date.valid += 1;
        }
        if is_dt_time {
            datetime.valid += 1;
        }

        let is_specific = is_bit || is_int || is_big || is_dec || is_dt_date || is_dt_time;
        if !is_specific {
            nvarchar.valid += 1;
        }
    }

    // Bigint is redundant with int unless the column genuinely needed 64 bits somewhere.
    bigint.disqualified = bigint_all_fit_int;

    let n = non_empty.len();
    let built = |candidate: Candidate| -> SqlColumnType {
        match candidate {
            Candidate::Bit => SqlColumnType::Bit { reliable: true },
            Candidate::Int => SqlColumnType::Int { reliable: true },
            Candidate::BigInt => SqlColumnType::BigInt { reliable: true },
            Candidate::Decimal => {
                let precision = (max_int_digits + max_frac_digits).max(1) as u8;
                let scale = max_frac_digits.min(precision as usize) as u8;
                SqlColumnType::Decimal { precision, scale, reliable: true }
            }
            Candidate::Date => SqlColumnType::Date { reliable: true },
            Candidate::DateTime => SqlColumnType::DateTime { reliable: true },
            Candidate::NVarChar => SqlColumnType::NVarChar { max: max_len > NVARCHAR_MAX_LEN, reliable: true },
        }
    };

    let tallies = [&bit, &int, &bigint, &decimal, &date, &datetime, &nvarchar];

    // Step 1: candidates that meet their own threshold.
    let mut qualifying: Vec<Candidate> = tallies.iter()
        .filter(|t| t.reliability(n) >= t.candidate.threshold())
        .map(|t| t.candidate)
        .collect();

    if qualifying.is_empty() {
        // Step 2: rescue the best 0.80-threshold candidate if it clears 0.50 and beats nvarchar.
        let nvarchar_reliability = nvarchar.reliability(n);
        let rescue = tallies.iter()
            .filter(|t| t.candidate.rescuable())
            .filter(|t| t.reliability(n) >= RESCUE_FLOOR && t.reliability(n) >= nvarchar_reliability)
            .max_by(|a, b| {
                a.reliability(n).partial_cmp(&b.reliability(n)).unwrap()
                    .then_with(|| b.candidate.priority().cmp(&a.candidate.priority()))
            });

        return match rescue {
            Some(t) => {
                log::debug!("rescued {:?} at {:.2} reliability ({} samples)", t.candidate, t.reliability(n), n);
                built(t.candidate)
            }
            None => {
                log::debug!("no candidate clears the rescue floor, inferring nvarchar(255)");
                SqlColumnType::nvarchar_255(false)
            }
        };
    }

    // Step 4: among qualifying candidates, highest reliability wins; ties broken by priority
    // (specific types before nvarchar).
    qualifying.sort_by(|a, b| {
        let ra = tallies.iter().find(|t| t.candidate == *a).unwrap().reliability(n);
        let rb = tallies.iter().find(|t| t.candidate == *b).unwrap().reliability(n);
        rb.partial_cmp(&ra).unwrap().then_with(|| a.priority().cmp(&b.priority()))
    });

    log::debug!("inferred {:?} from {} candidate(s), {} samples", qualifying[0], qualifying.len(), n);
    built(qualifying[0])
}

fn is_bit(value: &str) -> bool {
    BIT_VALUES.contains(&value.to_lowercase().as_str())
}

fn is_int32(value: &str) -> bool {
    i32::from_str(value).is_ok()
}

fn is_int64(value: &str) -> bool {
    i64::from_str(value).is_ok()
}

fn is_decimal(value: &str) -> bool {
    DECIMAL_SHAPE.is_match(value) && Decimal::from_str(value).is_ok()
}

fn decimal_digits(value: &str) -> (usize, usize) {
    let mantissa = value.split(['e', 'E']).next().unwrap_or(value);
    let mantissa = mantissa.trim_start_matches(['-', '+']);
    match mantissa.split_once('.') {
        Some((int_part, frac_part)) => (int_part.trim_start_matches('0').len().max(if int_part.is_empty() { 0 } else { 1 }), frac_part.len()),
        None => (mantissa.len(), 0),
    }
}

fn is_date(value: &str) -> bool {
    DATE_FORMATS.iter().any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
}

fn is_datetime(value: &str) -> bool {
    if chrono::DateTime::parse_from_rfc3339(value).is_ok() {
        return true;
    }
    DATETIME_FORMATS.iter().any(|fmt| NaiveDateTime::parse_from_str(value, fmt).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer(values: &[&str]) -> SqlColumnType {
        infer_column_type(values.iter().copied())
    }

    #[test]
    fn test_no_non_empty_values_falls_back_unreliable() {
        let dt = infer(&["", "  ", ""]);
        assert_eq!(SqlColumnType::NVarChar { max: false, reliable: false }, dt);
    }

    #[test]
    fn test_high_confidence_int_column() {
        let dt = infer(&["1", "2", "3", "42", "-7"]);
        assert_eq!(SqlColumnType::Int { reliable: true }, dt);
    }

    #[test]
    fn test_out_of_range_value_promotes_to_bigint() {
        let mut values: Vec<String> = (0..99).map(|i| i.to_string()).collect();
        values.push("9999999999999".to_string()); // outside i32 range, fits i64.
        let dt = infer_column_type(values.iter());
        assert_eq!(SqlColumnType::BigInt { reliable: true }, dt);
    }

    #[test]
    fn test_all_values_fit_int_bigint_is_never_chosen() {
        let values: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let dt = infer_column_type(values.iter());
        assert_eq!(SqlColumnType::Int { reliable: true }, dt);
    }

    #[test]
    fn test_85_percent_valid_ints_with_empties_computed_over_non_empty() {
        let mut values: Vec<&str> = vec!["1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17"];
        values.extend(["", "", ""]); // empties don't count in the denominator.
        let dt = infer(&values);
        assert_eq!(SqlColumnType::Int { reliable: true }, dt);
    }

    #[test]
    fn test_decimal_precision_and_scale() {
        let dt = infer(&["10.5", "123.456", "-9.1"]);
        assert_eq!(SqlColumnType::Decimal { precision: 6, scale: 3, reliable: true }, dt);
    }

    #[test]
    fn test_date_column() {
        let dt = infer(&["2024-01-02", "2024-02-03", "2024-03-04"]);
        assert_eq!(SqlColumnType::Date { reliable: true }, dt);
    }

    #[test]
    fn test_long_strings_choose_nvarchar_max() {
        let long = "x".repeat(300);
        let dt = infer(&[long.as_str(), "short"]);
        assert_eq!(SqlColumnType::NVarChar { max: true, reliable: true }, dt);
    }

    #[test]
    fn test_borderline_bit_falls_back_to_nvarchar_not_bit() {
        // 4/5 = 0.80 reliability for bit, below its 0.90 threshold; must not be rescued.
        let dt = infer(&["true", "0", "sim", "maybe", "1"]);
        assert_eq!(SqlColumnType::NVarChar { max: false, reliable: false }, dt);
    }

    #[test]
    fn test_mixed_mostly_strings_falls_back() {
        let dt = infer(&["hello", "world", "foo", "1"]);
        assert_eq!(SqlColumnType::NVarChar { max: false, reliable: false }, dt);
    }
}

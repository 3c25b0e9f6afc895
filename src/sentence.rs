//! Wire protocol for the ADM-300 serial link.
//!
//! The instrument emits one sentence per line, framed as `$<body>*<XX>`
//! where `XX` is the uppercase-hex XOR checksum of the body bytes. Body
//! fields are comma separated. Commands in the other direction are short
//! `#`-prefixed writes with no synchronous acknowledgment; their effect
//! shows up in subsequent sentences.

use crate::reading::Reading;

/// Nominal length of a rate sentence. Other lengths are flagged in raw
/// output for diagnostics but never rejected.
pub const RAW_SENTENCE_LEN: usize = 47;

/// Start periodic reporting.
pub const CMD_START_REPORTS: &[u8] = b"#R1\r";
/// Stop periodic reporting.
pub const CMD_STOP_REPORTS: &[u8] = b"#R0\r";
/// Zero the accumulated dose register.
pub const CMD_CLEAR_DOSE: &[u8] = b"#CD\r";
/// Silence the audible alarm.
pub const CMD_CLEAR_ALARM: &[u8] = b"#CA\r";

/// A line that did not produce a structured reading, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub text: String,
}

impl RawLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// True when the line length differs from [`RAW_SENTENCE_LEN`].
    pub fn unexpected_length(&self) -> bool {
        self.text.len() != RAW_SENTENCE_LEN
    }
}

/// Outcome of parsing one line of instrument output.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// A structured reading; `valid` is false when checksum or field
    /// validation failed.
    Reading(Reading),
    /// Opaque passthrough: banners, unknown sentence types, unframed or
    /// garbled lines.
    Raw(RawLine),
}

/// XOR checksum over the sentence body (the bytes between `$` and `*`).
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// True for lines that mark an instrument power-on: the `$ADP` boot
/// sentence or the bare firmware banner.
pub fn is_power_on(line: &str) -> bool {
    line.starts_with("$ADP") || line.contains("ADM-300")
}

/// Split `$<body>*<XX>` framing. Returns the body and whether the
/// checksum matched, or `None` when the line is not framed at all.
fn split_frame(line: &str) -> Option<(&str, bool)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_prefix('$')?;
    let (body, sum) = inner.rsplit_once('*')?;
    let expected = u8::from_str_radix(sum, 16).ok()?;
    Some((body, checksum(body) == expected))
}

/// Parse one line of instrument output.
///
/// Never fails: damaged numeric fields degrade to a `valid = false`
/// reading with best-effort partial values, and anything that is not a
/// framed report degrades to raw passthrough.
pub fn parse(line: &str) -> Parsed {
    let Some((body, checksum_ok)) = split_frame(line) else {
        return Parsed::Raw(RawLine::new(line));
    };
    let mut fields = body.split(',');
    match fields.next() {
        Some("ADR") => Parsed::Reading(parse_report(fields, checksum_ok, false)),
        Some("ADS") => Parsed::Reading(parse_report(fields, checksum_ok, true)),
        _ => Parsed::Raw(RawLine::new(line)),
    }
}

fn parse_report<'a>(
    mut fields: impl Iterator<Item = &'a str>,
    checksum_ok: bool,
    with_thresholds: bool,
) -> Reading {
    let mut ok = checksum_ok;
    let probe = take_str(&mut fields, &mut ok);
    let probe_flag = take_str(&mut fields, &mut ok);
    let dose_rt = take_f64(&mut fields, &mut ok);
    let dose_rt_unf = take_f64(&mut fields, &mut ok);
    let dose_acc = take_f64(&mut fields, &mut ok);
    let dose_unit = take_str(&mut fields, &mut ok);
    let (batt_alarm, dose_alarm, rate_alarm) = take_alarms(&mut fields, &mut ok);
    // A damaged threshold field invalidates the reading but must stay
    // None rather than turn into a phantom zero threshold.
    let (rate_alarm_thresh, dose_alarm_thresh) = if with_thresholds {
        (take_opt_f64(&mut fields, &mut ok), take_opt_f64(&mut fields, &mut ok))
    } else {
        (None, None)
    };
    if fields.next().is_some() {
        ok = false;
    }
    Reading {
        valid: ok,
        probe,
        probe_flag,
        dose_rt,
        dose_rt_unf,
        dose_acc,
        dose_unit,
        batt_alarm,
        dose_alarm,
        rate_alarm,
        rate_alarm_thresh,
        dose_alarm_thresh,
    }
}

fn take_str<'a>(fields: &mut impl Iterator<Item = &'a str>, ok: &mut bool) -> String {
    match fields.next() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            *ok = false;
            String::new()
        }
    }
}

fn take_f64<'a>(fields: &mut impl Iterator<Item = &'a str>, ok: &mut bool) -> f64 {
    match fields.next().and_then(|s| s.trim().parse::<f64>().ok()) {
        Some(v) => v,
        None => {
            *ok = false;
            0.0
        }
    }
}

fn take_opt_f64<'a>(fields: &mut impl Iterator<Item = &'a str>, ok: &mut bool) -> Option<f64> {
    match fields.next().map(|s| s.trim().parse::<f64>()) {
        Some(Ok(v)) => Some(v),
        _ => {
            *ok = false;
            None
        }
    }
}

/// Alarm flags field: three `0`/`1` digits in the order battery, dose,
/// rate.
fn take_alarms<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    ok: &mut bool,
) -> (bool, bool, bool) {
    let flags = fields.next().unwrap_or("").as_bytes();
    if flags.len() != 3 || flags.iter().any(|b| !matches!(b, b'0' | b'1')) {
        *ok = false;
        return (false, false, false);
    }
    (flags[0] == b'1', flags[1] == b'1', flags[2] == b'1')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::seal;

    const RATE_BODY: &str = "ADR,GM01,N,1.23E-04,1.20E-04,4.56E-02,R,000";
    const STATUS_BODY: &str = "ADS,GM01,N,1.23E-04,1.20E-04,4.56E-02,R,011,1.00E-02,5.00E+00";

    #[test]
    fn test_checksum_known_value() {
        // A(41) ^ D(44) ^ P(50) ^ ,(2C) ^ P(50) ^ W(57) ^ R(52) = 2C
        assert_eq!(checksum("ADP,PWR"), 0x2C);
    }

    #[test]
    fn test_rate_sentence_has_nominal_length() {
        assert_eq!(seal(RATE_BODY).len(), RAW_SENTENCE_LEN);
    }

    #[test]
    fn test_parse_rate_sentence() {
        let parsed = parse(&seal(RATE_BODY));
        let Parsed::Reading(reading) = parsed else {
            panic!("expected a reading, got {parsed:?}");
        };
        assert!(reading.valid);
        assert_eq!(reading.probe, "GM01");
        assert_eq!(reading.probe_flag, "N");
        assert!((reading.dose_rt - 1.23e-4).abs() < 1e-12);
        assert!((reading.dose_rt_unf - 1.20e-4).abs() < 1e-12);
        assert!((reading.dose_acc - 4.56e-2).abs() < 1e-12);
        assert_eq!(reading.dose_unit, "R");
        assert!(!reading.batt_alarm);
        assert!(!reading.dose_alarm);
        assert!(!reading.rate_alarm);
        // Rate sentences never carry thresholds
        assert_eq!(reading.rate_alarm_thresh, None);
        assert_eq!(reading.dose_alarm_thresh, None);
    }

    #[test]
    fn test_parse_status_sentence_carries_thresholds() {
        let Parsed::Reading(reading) = parse(&seal(STATUS_BODY)) else {
            panic!("expected a reading");
        };
        assert!(reading.valid);
        assert!(!reading.batt_alarm);
        assert!(reading.dose_alarm);
        assert!(reading.rate_alarm);
        assert_eq!(reading.rate_alarm_thresh, Some(1.00e-2));
        assert_eq!(reading.dose_alarm_thresh, Some(5.0));
    }

    #[test]
    fn test_checksum_mismatch_degrades_to_invalid() {
        let line = format!("${RATE_BODY}*00");
        let Parsed::Reading(reading) = parse(&line) else {
            panic!("expected a degraded reading");
        };
        assert!(!reading.valid);
        // Fields are still parsed best-effort
        assert_eq!(reading.probe, "GM01");
        assert!((reading.dose_acc - 4.56e-2).abs() < 1e-12);
    }

    #[test]
    fn test_garbled_numeric_field_degrades_to_invalid() {
        let body = "ADR,GM01,N,1.2X?-04,1.20E-04,4.56E-02,R,000";
        let Parsed::Reading(reading) = parse(&seal(body)) else {
            panic!("expected a degraded reading");
        };
        assert!(!reading.valid);
        assert_eq!(reading.dose_rt, 0.0);
        assert!((reading.dose_rt_unf - 1.20e-4).abs() < 1e-12);
    }

    #[test]
    fn test_truncated_sentence_leaves_thresholds_unset() {
        let body = "ADS,GM01,N,1.23E-04";
        let Parsed::Reading(reading) = parse(&seal(body)) else {
            panic!("expected a degraded reading");
        };
        assert!(!reading.valid);
        assert_eq!(reading.rate_alarm_thresh, None);
        assert_eq!(reading.dose_alarm_thresh, None);
    }

    #[test]
    fn test_bad_alarm_flags_degrade_to_invalid() {
        let body = "ADR,GM01,N,1.23E-04,1.20E-04,4.56E-02,R,0x1";
        let Parsed::Reading(reading) = parse(&seal(body)) else {
            panic!("expected a degraded reading");
        };
        assert!(!reading.valid);
        assert!(!reading.batt_alarm);
    }

    #[test]
    fn test_unframed_line_passes_through_raw() {
        let parsed = parse("not a sentence");
        assert_eq!(parsed, Parsed::Raw(RawLine::new("not a sentence")));
    }

    #[test]
    fn test_unknown_sentence_type_passes_through_raw() {
        let line = seal("ADX,whatever");
        assert!(matches!(parse(&line), Parsed::Raw(_)));
    }

    #[test]
    fn test_power_on_banner_passes_through_raw() {
        assert!(matches!(parse("$ADP,PWR*2C"), Parsed::Raw(_)));
    }

    #[test]
    fn test_is_power_on() {
        assert!(is_power_on("$ADP,PWR*2C"));
        assert!(is_power_on("ADM-300 v1.9"));
        assert!(!is_power_on(&seal(RATE_BODY)));
        assert!(!is_power_on("noise"));
    }

    #[test]
    fn test_raw_line_length_flag() {
        assert!(!RawLine::new(seal(RATE_BODY)).unexpected_length());
        assert!(RawLine::new("short").unexpected_length());
        assert!(RawLine::new(seal(STATUS_BODY)).unexpected_length());
    }

    #[test]
    fn test_parse_never_panics_on_junk() {
        for line in ["", "$", "$*", "$*ZZ", "$ADR*", "$ADR,*7F", "\u{fffd}$,*"] {
            let _ = parse(line);
        }
    }
}

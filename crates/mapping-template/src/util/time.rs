use std::fmt::Write;

use chrono::{
    format::{Item, StrftimeItems},
    DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc,
};

use crate::{
    methods::{arg, string_arg},
    value::NativeObject,
    RenderError, TemplateValue,
};

#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("timezone conversion is not supported")]
    Timezone,
    #[error("unsupported date pattern letter `{0}`")]
    PatternLetter(char),
    #[error("unterminated quote in date pattern `{0}`")]
    UnterminatedQuote(String),
    #[error("could not parse `{input}`: {source}")]
    Parse {
        input: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("epoch milliseconds {0} are out of range")]
    OutOfRange(i64),
    #[error("could not format date with `{0}`")]
    Format(String),
}

impl From<TimeError> for RenderError {
    fn from(error: TimeError) -> Self {
        RenderError::Evaluation(error.to_string())
    }
}

/// `$util.time`, bound to the instant the resolution started.
pub(super) struct TimeUtil {
    now: DateTime<Utc>,
}

impl TimeUtil {
    pub(super) fn new(now: DateTime<Utc>) -> Self {
        TimeUtil { now }
    }
}

impl NativeObject for TimeUtil {
    fn type_name(&self) -> &'static str {
        "util.time"
    }

    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        let value: TemplateValue = match method {
            "nowISO8601" => iso8601(&self.now).into(),
            "nowEpochSeconds" => self.now.timestamp().into(),
            "nowEpochMilliSeconds" => self.now.timestamp_millis().into(),
            "nowFormatted" => {
                reject_timezone(args, 1)?;
                format(&self.now, &string_arg(args, 0)?)?.into()
            }
            "parseISO8601ToEpochMilliSeconds" => {
                let input = string_arg(args, 0)?;
                DateTime::parse_from_rfc3339(&input)
                    .map_err(|source| TimeError::Parse { input, source })?
                    .timestamp_millis()
                    .into()
            }
            "epochMilliSecondsToSeconds" => (millis_arg(args, 0)? / 1000).into(),
            "epochMilliSecondsToISO8601" => iso8601(&from_millis(millis_arg(args, 0)?)?).into(),
            "epochMilliSecondsToFormatted" => {
                reject_timezone(args, 2)?;
                format(&from_millis(millis_arg(args, 0)?)?, &string_arg(args, 1)?)?.into()
            }
            "parseFormattedToEpochMilliSeconds" => {
                reject_timezone(args, 2)?;
                parse(&string_arg(args, 0)?, &string_arg(args, 1)?)?.into()
            }
            _ => return Err(RenderError::unsupported("util.time", method)),
        };

        Ok(value)
    }
}

fn iso8601(instant: &DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn reject_timezone(args: &[TemplateValue], position: usize) -> Result<(), TimeError> {
    if arg(args, position).is_null_or_undefined() {
        Ok(())
    } else {
        Err(TimeError::Timezone)
    }
}

fn millis_arg(args: &[TemplateValue], position: usize) -> Result<i64, RenderError> {
    let value = arg(args, position);
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| RenderError::evaluation(format!("expected epoch milliseconds, got {}", value.type_name())))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, TimeError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(TimeError::OutOfRange(millis))
}

fn format(instant: &DateTime<Utc>, pattern: &str) -> Result<String, TimeError> {
    let chrono_format = java_format_to_chrono(pattern)?;

    if StrftimeItems::new(&chrono_format).any(|item| matches!(item, Item::Error)) {
        return Err(TimeError::Format(pattern.to_string()));
    }

    let mut out = String::new();
    write!(out, "{}", instant.format(&chrono_format)).map_err(|_| TimeError::Format(pattern.to_string()))?;
    Ok(out)
}

fn parse(input: &str, pattern: &str) -> Result<i64, TimeError> {
    let chrono_format = java_format_to_chrono(pattern)?;

    if let Ok(instant) = DateTime::parse_from_str(input, &chrono_format) {
        return Ok(instant.timestamp_millis());
    }
    if let Ok(instant) = NaiveDateTime::parse_from_str(input, &chrono_format) {
        return Ok(instant.and_utc().timestamp_millis());
    }

    let date = NaiveDate::parse_from_str(input, &chrono_format).map_err(|source| TimeError::Parse {
        input: input.to_string(),
        source,
    })?;

    date.and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc().timestamp_millis())
        .ok_or_else(|| TimeError::Format(pattern.to_string()))
}

/// Translates a Java `SimpleDateFormat` pattern into a chrono format string.
pub fn java_format_to_chrono(pattern: &str) -> Result<String, TimeError> {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                out.push('\'');
                continue;
            }

            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        out.push('\'');
                    }
                    Some('\'') => break,
                    Some('%') => out.push_str("%%"),
                    Some(literal) => out.push(literal),
                    None => return Err(TimeError::UnterminatedQuote(pattern.to_string())),
                }
            }
            continue;
        }

        if !c.is_ascii_alphabetic() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
            continue;
        }

        let mut run = 1;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }

        let specifier = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', 1) => "%-I",
            ('h', _) => "%I",
            ('m', 1) => "%-M",
            ('m', _) => "%M",
            ('s', 1) => "%-S",
            ('s', _) => "%S",
            ('S', _) => "%3f",
            ('a', _) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('D', _) => "%j",
            ('u', _) => "%u",
            ('z', _) => "%Z",
            ('Z', _) => "%z",
            ('X', _) => "%:z",
            (other, _) => return Err(TimeError::PatternLetter(other)),
        };
        out.push_str(specifier);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    fn util() -> TimeUtil {
        TimeUtil::new(Utc.with_ymd_and_hms(2010, 2, 1, 0, 2, 0).unwrap())
    }

    fn call(method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        util().call(method, args)
    }

    #[test]
    fn now_variants_share_one_instant() {
        assert_eq!(call("nowISO8601", &[]).unwrap().as_str(), Some("2010-02-01T00:02:00.000Z"));
        assert_eq!(call("nowEpochSeconds", &[]).unwrap().as_i64(), Some(1_264_982_520));
        assert_eq!(call("nowEpochMilliSeconds", &[]).unwrap().as_i64(), Some(1_264_982_520_000));
    }

    #[test]
    fn now_formatted() {
        let formatted = call("nowFormatted", &["yyyy-MM-dd HH:mm:ss".into()]).unwrap();
        assert_eq!(formatted.as_str(), Some("2010-02-01 00:02:00"));

        let formatted = call("nowFormatted", &["d MMM yyyy 'at' h:mm a".into()]).unwrap();
        assert_eq!(formatted.as_str(), Some("1 Feb 2010 at 12:02 AM"));
    }

    #[test]
    fn timezones_are_rejected() {
        let error = call("nowFormatted", &["yyyy".into(), "Europe/Berlin".into()]).unwrap_err();
        assert_snapshot!(error, @"timezone conversion is not supported");

        assert!(call("nowFormatted", &["yyyy".into(), TemplateValue::null()]).is_ok());
    }

    #[test]
    fn epoch_conversions() {
        let millis = TemplateValue::from(1_264_982_520_123_i64);

        assert_eq!(
            call("epochMilliSecondsToSeconds", &[millis.clone()]).unwrap().as_i64(),
            Some(1_264_982_520)
        );
        assert_eq!(
            call("epochMilliSecondsToISO8601", &[millis.clone()]).unwrap().as_str(),
            Some("2010-02-01T00:02:00.123Z")
        );
        assert_eq!(
            call("epochMilliSecondsToFormatted", &[millis, "yyyy/MM/dd SSS".into()])
                .unwrap()
                .as_str(),
            Some("2010/02/01 123")
        );
    }

    #[test]
    fn parsing() {
        let parsed = call("parseISO8601ToEpochMilliSeconds", &["2010-02-01T00:02:00.000Z".into()]).unwrap();
        assert_eq!(parsed.as_i64(), Some(1_264_982_520_000));

        let parsed = call(
            "parseFormattedToEpochMilliSeconds",
            &["2010-02-01 00:02:00".into(), "yyyy-MM-dd HH:mm:ss".into()],
        )
        .unwrap();
        assert_eq!(parsed.as_i64(), Some(1_264_982_520_000));

        let parsed = call(
            "parseFormattedToEpochMilliSeconds",
            &["2010-02-01".into(), "yyyy-MM-dd".into()],
        )
        .unwrap();
        assert_eq!(parsed.as_i64(), Some(1_264_982_400_000));
    }

    #[test]
    fn pattern_translation() {
        assert_eq!(java_format_to_chrono("yyyy-MM-dd'T'HH:mm:ss.SSSZ").unwrap(), "%Y-%m-%dT%H:%M:%S.%3f%z");
        assert_eq!(java_format_to_chrono("'It''s' 100%").unwrap(), "It's 100%%");
        assert!(matches!(java_format_to_chrono("Q"), Err(TimeError::PatternLetter('Q'))));
    }
}

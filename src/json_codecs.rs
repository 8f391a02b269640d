use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{de, Deserialize, Deserializer, Serializer};

const DATE_FORMAT: &str = "%Y-%m-%d";

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.date())
        })
}

/// Accepts a plain date, or a timestamp in any of the shapes the query engine emits for
/// `date_trunc` columns, and keeps only the date.
pub fn date_from_timestamp_string<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_date(&s).ok_or_else(|| {
        de::Error::invalid_value(
            de::Unexpected::Str(&s),
            &"a date or timestamp e.g. \"2023-01-02\" or \"2023-01-02T00:00:00.000Z\"",
        )
    })
}

pub fn to_date_string<S>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&date.format(DATE_FORMAT).to_string())
}

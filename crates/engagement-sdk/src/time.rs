use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Wire format for every date field: extended ISO-8601 with milliseconds.
pub const PDT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Supplies the player's current playhead as seconds since the Unix epoch,
/// or `None` while the player has no program date time.
pub trait PlayerTimeSource: Send + Sync {
    fn playhead_seconds(&self) -> Option<f64>;

    fn playhead(&self) -> Option<DateTime<Utc>> {
        self.playhead_seconds().and_then(seconds_to_datetime)
    }
}

impl<F> PlayerTimeSource for F
where
    F: Fn() -> Option<f64> + Send + Sync,
{
    fn playhead_seconds(&self) -> Option<f64> {
        (self)()
    }
}

pub fn seconds_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

pub fn format_pdt(value: &DateTime<Utc>) -> String {
    value.format(PDT_FORMAT).to_string()
}

pub fn parse_pdt(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw, PDT_FORMAT).map(|naive| naive.and_utc())
}

/// `#[serde(with = "pdt_format")]` for `DateTime<Utc>` fields.
pub mod pdt_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_pdt(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_pdt(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_some(&crate::time::format_pdt(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| crate::time::parse_pdt(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_milliseconds() {
        let value = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(format_pdt(&value), "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_pdt("2023-11-14T22:13:20.123Z").unwrap(), value);
    }

    #[test]
    fn closures_act_as_time_sources() {
        let source = || Some(1_700_000_000.5);
        let playhead = source.playhead().expect("playhead");
        assert_eq!(playhead.timestamp_millis(), 1_700_000_000_500);

        let unsynced = || None::<f64>;
        assert!(unsynced.playhead().is_none());
        assert!(seconds_to_datetime(f64::NAN).is_none());
    }
}

//! Serde adapter for durations written as seconds or humantime strings.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Secs(u64),
    Text(String),
}

fn parse(raw: Raw) -> Result<Duration, String> {
    match raw {
        Raw::Secs(s) => Ok(Duration::from_secs(s)),
        Raw::Text(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<u64>() {
                return Ok(Duration::from_secs(secs));
            }
            humantime::parse_duration(s).map_err(|e| format!("invalid duration {s:?}: {e}"))
        }
    }
}

/// `Option<Duration>` fields: `10`, `"10"`, `"1m30s"` and `"500ms"` are all accepted.
pub mod opt {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            Some(raw) => parse(raw).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct Holder {
        #[serde(default, with = "super::opt")]
        d: Option<Duration>,
    }

    #[test]
    fn accepts_seconds_and_units() {
        let h: Holder = serde_json::from_str(r#"{"d": 15}"#).unwrap();
        assert_eq!(h.d, Some(Duration::from_secs(15)));
        let h: Holder = serde_json::from_str(r#"{"d": "1m30s"}"#).unwrap();
        assert_eq!(h.d, Some(Duration::from_secs(90)));
        let h: Holder = serde_json::from_str(r#"{"d": "250ms"}"#).unwrap();
        assert_eq!(h.d, Some(Duration::from_millis(250)));
        let h: Holder = serde_json::from_str("{}").unwrap();
        assert_eq!(h.d, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"d": "soon"}"#).is_err());
    }
}

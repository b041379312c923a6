//! # Utilities

use crate::Result;

/// Content identifier helpers.
pub mod cid {
    use multihash_codetable::{Code, MultihashDigest};
    use serde::Serialize;

    use crate::{Result, unexpected};

    /// The dag-cbor multicodec code.
    const DAG_CBOR: u64 = 0x71;

    /// Compute the CID of the provided value from its canonical CBOR
    /// encoding.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be serialized to CBOR.
    pub fn from_value<T: Serialize>(value: &T) -> Result<String> {
        let buf = serde_ipld_dagcbor::to_vec(value)
            .map_err(|e| unexpected!("issue encoding CBOR: {e}"))?;
        let hash = Code::Sha2_256.digest(&buf);
        Ok(cid::Cid::new_v1(DAG_CBOR, hash).to_string())
    }
}

/// URI helpers.
pub mod uri {
    use crate::{Result, invalid};

    /// Validate that the URI has a scheme and a non-empty body.
    ///
    /// # Errors
    ///
    /// Fails when the URI is not of the form `<scheme>://<authority/path>`.
    pub fn validate(uri: &str) -> Result<()> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            return Err(invalid!("invalid URL: {uri}"));
        };
        if scheme.is_empty() || rest.is_empty() {
            return Err(invalid!("invalid URL: {uri}"));
        }
        Ok(())
    }
}

/// Normalize a protocol or schema URL: validates the URL and strips any
/// trailing slashes so equal URLs compare byte-identical.
///
/// # Errors
///
/// Fails when the URL is invalid.
pub fn clean_url(url: &str) -> Result<String> {
    uri::validate(url)?;
    Ok(url.trim_end_matches('/').to_string())
}

/// Serialize a `DateTime<Utc>` as an RFC 3339 string with microsecond
/// precision, the format used throughout for message timestamps.
pub mod rfc3339_micros {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize with microsecond precision.
    ///
    /// # Errors
    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339_opts(Micros, true))
    }

    /// Deserialize from an RFC 3339 string.
    ///
    /// # Errors
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|date| date.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// As [`rfc3339_micros`], for optional timestamps.
pub mod rfc3339_micros_opt {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize with microsecond precision.
    ///
    /// # Errors
    pub fn serialize<S: Serializer>(
        date: &Option<DateTime<Utc>>, serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match date {
            Some(date) => serializer.serialize_str(&date.to_rfc3339_opts(Micros, true)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from an RFC 3339 string.
    ///
    /// # Errors
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&s)
            .map(|date| Some(date.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_url_strips_trailing_slash() {
        assert_eq!(clean_url("https://example.com/chat/").unwrap(), "https://example.com/chat");
        assert_eq!(clean_url("https://example.com/chat").unwrap(), "https://example.com/chat");
    }

    #[test]
    fn clean_url_rejects_schemeless() {
        assert!(clean_url("example.com/chat").is_err());
        assert!(clean_url("").is_err());
    }

    #[test]
    fn cid_is_deterministic() {
        use serde::Serialize;

        #[derive(Serialize)]
        struct Payload {
            record_id: String,
        }

        let payload = Payload {
            record_id: "bafy".to_string(),
        };
        let cid_1 = cid::from_value(&payload).unwrap();
        let cid_2 = cid::from_value(&payload).unwrap();
        assert_eq!(cid_1, cid_2);
        assert!(cid_1.starts_with("bafy"));
    }
}

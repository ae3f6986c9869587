//! Length-preserving printable encoding for byte payloads.
//!
//! Stored values and HTTP bodies cross text-only channels (the storage
//! primitive only holds strings, envelopes are JSON), so raw bytes are
//! carried as standard padded base64.

use base64::prelude::*;

pub fn encode(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(text)
}

/// `#[serde(with = "codec::serde_base64")]` for `Vec<u8>` fields.
pub mod serde_base64 {
    pub fn serialize<S>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_str(&super::encode(bytes))
    }

    struct Visitor;

    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("base64")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            super::decode(v).map_err(|_| serde::de::Error::custom("invalid base64"))
        }
    }

    /// Lifts a visitor over `null`.
    struct OptionVisitor<V>(V);

    impl<'de, V> serde::de::Visitor<'de> for OptionVisitor<V>
    where
        V: serde::de::Visitor<'de>,
    {
        type Value = Option<V::Value>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.0.expecting(f)?;
            f.write_str(" or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, d: D) -> Result<Self::Value, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            d.deserialize_any(self.0).map(Some)
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        d.deserialize_str(Visitor)
    }

    pub mod opt {
        pub fn serialize<S>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            match bytes {
                Some(bytes) => super::serialize(bytes, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(d: D) -> Result<Option<Vec<u8>>, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            d.deserialize_option(super::OptionVisitor(super::Visitor))
        }
    }
}

//! JSON schema of the request descriptor (guest -> host) and the result
//! envelope (host -> guest).

use crate::{codec, network::NativeRequest, Error, Result};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error as ThisError;
use url::Url;

pub type Params = Vec<(String, String)>;

fn default_method() -> String {
    "GET".to_owned()
}

/// `null` is accepted wherever a list is optional.
fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub query_params: Params,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header_params: Params,
    /// Form body; takes precedence over `content_base64`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_params: Params,
    #[serde(
        default,
        with = "codec::serde_base64::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_base64: Option<Vec<u8>>,
    /// `<= 0` means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            query_params: Vec::new(),
            header_params: Vec::new(),
            content_params: Vec::new(),
            content_base64: None,
            timeout_ms: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn method(&self) -> Result<Method> {
        let method = match self.method.to_ascii_uppercase().as_str() {
            m @ ("DELETE" | "GET" | "HEAD" | "OPTIONS" | "PATCH" | "POST" | "PUT") => m.to_owned(),
            _ => self.method.clone(),
        };
        Method::from_bytes(method.as_bytes()).map_err(|_| Error::InvalidMethod(self.method.clone()))
    }

    /// Target URL with the query parameters appended in order.
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        if !self.query_params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query_params);
        }
        Ok(url)
    }

    /// Header set; a repeated name keeps the last value.
    pub fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(self.header_params.len());
        for (name, value) in &self.header_params {
            let invalid = || Error::InvalidHeader { name: name.clone() };
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    pub fn body(&self) -> Option<Vec<u8>> {
        if !self.content_params.is_empty() {
            let form = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.content_params)
                .finish();
            Some(form.into_bytes())
        } else {
            self.content_base64.clone().filter(|bytes| !bytes.is_empty())
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    pub fn to_native(&self) -> Result<NativeRequest> {
        Ok(NativeRequest {
            method: self.method()?,
            url: self.url()?,
            headers: self.headers()?,
            body: self.body(),
        })
    }
}

#[derive(ThisError, Debug)]
pub enum EnvelopeError {
    #[error("envelope has both \"status\" and \"error\"")]
    Ambiguous,
    #[error("envelope has neither \"status\" nor \"error\"")]
    Empty,
    #[error("missing field \"{0}\"")]
    Missing(&'static str),
}

/// Outcome of a request, exactly one of a response or an error.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResultEnvelope {
    Response {
        status: u16,
        header_params: Params,
        #[serde(with = "codec::serde_base64")]
        content_base64: Vec<u8>,
    },
    Error {
        error: String,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    status: Option<u16>,
    header_params: Option<Params>,
    #[serde(default, with = "codec::serde_base64::opt")]
    content_base64: Option<Vec<u8>>,
    error: Option<String>,
}

impl TryFrom<RawEnvelope> for ResultEnvelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> std::result::Result<Self, EnvelopeError> {
        match (raw.status, raw.error) {
            (Some(_), Some(_)) => Err(EnvelopeError::Ambiguous),
            (None, None) => Err(EnvelopeError::Empty),
            (None, Some(error)) => Ok(ResultEnvelope::Error { error }),
            (Some(status), None) => Ok(ResultEnvelope::Response {
                status,
                header_params: raw
                    .header_params
                    .ok_or(EnvelopeError::Missing("header_params"))?,
                content_base64: raw
                    .content_base64
                    .ok_or(EnvelopeError::Missing("content_base64"))?,
            }),
        }
    }
}

impl<'de> Deserialize<'de> for ResultEnvelope {
    fn deserialize<D>(d: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawEnvelope::deserialize(d)?
            .try_into()
            .map_err(serde::de::Error::custom)
    }
}

impl ResultEnvelope {
    pub fn error(error: impl ToString) -> Self {
        ResultEnvelope::Error {
            error: error.to_string(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResultEnvelope::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::CONTENT_TYPE;

    #[test]
    fn test_parse_minimal() {
        let desc = RequestDescriptor::parse(r#"{"url":"https://e.x/api"}"#).unwrap();
        assert_eq!(desc, RequestDescriptor::new("https://e.x/api"));
        assert_eq!(desc.method().unwrap(), Method::GET);
        assert_eq!(desc.body(), None);
        assert_eq!(desc.timeout(), None);
    }

    #[test]
    fn test_parse_nulls() {
        let desc = RequestDescriptor::parse(
            r#"{"url":"https://e.x","method":"post","query_params":null,"header_params":null,"content_params":null,"content_base64":null}"#,
        )
        .unwrap();
        assert_eq!(desc.method().unwrap(), Method::POST);
        assert!(desc.query_params.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(RequestDescriptor::parse("{").is_err());
        assert!(RequestDescriptor::parse(r#"{"method":"GET"}"#).is_err());
        assert!(RequestDescriptor::parse(r#"{"url":"https://e.x","query_params":[["q"]]}"#).is_err());
        assert!(RequestDescriptor::parse(r#"{"url":"https://e.x","content_base64":"%%%"}"#).is_err());
    }

    #[test]
    fn test_url_query_order() {
        let mut desc = RequestDescriptor::new("https://e.x/api?a=0");
        desc.query_params = vec![
            ("q".into(), "1".into()),
            ("q".into(), "2 3".into()),
            ("z".into(), "&".into()),
        ];
        assert_eq!(
            desc.url().unwrap().as_str(),
            "https://e.x/api?a=0&q=1&q=2+3&z=%26"
        );

        assert_eq!(
            RequestDescriptor::new("https://e.x/api").url().unwrap().as_str(),
            "https://e.x/api"
        );
        assert!(RequestDescriptor::new("not a url").url().is_err());
    }

    #[test]
    fn test_headers_last_write_wins() {
        let mut desc = RequestDescriptor::new("https://e.x");
        desc.header_params = vec![
            ("Content-Type".into(), "text/plain".into()),
            ("X-Id".into(), "1".into()),
            ("content-type".into(), "application/json".into()),
        ];
        let headers = desc.headers().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        desc.header_params = vec![("bad header".into(), "x".into())];
        assert!(matches!(desc.headers(), Err(Error::InvalidHeader { .. })));
    }

    #[test]
    fn test_body_precedence() {
        let mut desc = RequestDescriptor::new("https://e.x");
        desc.content_base64 = Some(b"raw".to_vec());
        assert_eq!(desc.body().unwrap(), b"raw");

        desc.content_params = vec![("a".into(), "1 2".into()), ("b".into(), "&".into())];
        assert_eq!(desc.body().unwrap(), b"a=1+2&b=%26");

        desc.content_params.clear();
        desc.content_base64 = Some(Vec::new());
        assert_eq!(desc.body(), None);
    }

    #[test]
    fn test_timeout() {
        let mut desc = RequestDescriptor::new("https://e.x");
        for (ms, expected) in [(0, None), (-5, None), (250, Some(Duration::from_millis(250)))] {
            desc.timeout_ms = Some(ms);
            assert_eq!(desc.timeout(), expected);
        }
    }

    #[test]
    fn test_envelope_json() {
        let ok = ResultEnvelope::Response {
            status: 200,
            header_params: vec![("set-cookie".into(), "a".into()), ("set-cookie".into(), "b".into())],
            content_base64: b"hi".to_vec(),
        };
        let json = ok.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"status":200,"header_params":[["set-cookie","a"],["set-cookie","b"]],"content_base64":"aGk="}"#
        );
        assert_eq!(ResultEnvelope::parse(&json).unwrap(), ok);

        let err = ResultEnvelope::error("boom");
        assert_eq!(err.to_json().unwrap(), r#"{"error":"boom"}"#);
        assert!(ResultEnvelope::parse(r#"{"error":"boom"}"#).unwrap().is_error());
    }

    #[test]
    fn test_envelope_strict() {
        assert!(ResultEnvelope::parse(r#"{"status":200,"error":"x","header_params":[],"content_base64":""}"#).is_err());
        assert!(ResultEnvelope::parse(r#"{}"#).is_err());
        assert!(ResultEnvelope::parse(r#"{"status":200,"header_params":[]}"#).is_err());
        assert!(ResultEnvelope::parse(r#"{"error":"x","extra":1}"#).is_err());
    }
}

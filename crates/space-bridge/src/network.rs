//! Native network primitive.

use crate::{config::HttpConfig, Result};
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Method};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeResponse {
    pub status: u16,
    /// Every response header in order, repeated names included.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Performs one HTTP exchange. Non-2xx statuses are responses, not errors;
/// only transport failures are `Err`.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: NativeRequest) -> Result<NativeResponse>;
}

#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        if let Some(ms) = config.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: NativeRequest) -> Result<NativeResponse> {
        tracing::debug!("{} {}", request.method, request.url);
        let mut req = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            req = req.body(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = resp.bytes().await?.to_vec();

        Ok(NativeResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RequestDescriptor;

    #[tokio::test]
    async fn test_fetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/resource")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "1".into()))
            .match_header("x-token", "b")
            .match_body("a=1")
            .with_status(201)
            .with_header("set-cookie", "x=1")
            .with_header("set-cookie", "y=2")
            .with_body([0xffu8, 0x00, 0x7f])
            .create_async()
            .await;

        let mut desc = RequestDescriptor::new(format!("{}/api/resource", server.url()));
        desc.method = "POST".into();
        desc.query_params = vec![("q".into(), "1".into())];
        desc.header_params = vec![("x-token".into(), "a".into()), ("x-token".into(), "b".into())];
        desc.content_params = vec![("a".into(), "1".into())];

        let network = HttpNetwork::new(&HttpConfig::default()).unwrap();
        let resp = network.fetch(desc.to_native().unwrap()).await.unwrap();
        mock.assert_async().await;

        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, [0xff, 0x00, 0x7f]);
        let cookies = resp
            .headers
            .iter()
            .filter(|(k, _)| k == "set-cookie")
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>();
        assert_eq!(cookies, ["x=1", "y=2"]);
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("nope")
            .create_async()
            .await;

        let url = format!("{}/missing", server.url());
        let network = HttpNetwork::new(&HttpConfig::default()).unwrap();
        let resp = network
            .fetch(RequestDescriptor::new(url).to_native().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, b"nope");
    }

    #[tokio::test]
    async fn test_fetch_transport_error() {
        // nothing listens on port 9 of the loopback interface
        let network = HttpNetwork::new(&HttpConfig::default()).unwrap();
        let result = network
            .fetch(RequestDescriptor::new("http://127.0.0.1:9/").to_native().unwrap())
            .await;
        assert!(result.is_err());
    }
}

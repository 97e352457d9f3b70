use std::time::Duration;

use async_trait::async_trait;

use crate::error::KeySetError;
use crate::key::JwkDocument;

/// KeySetFetcher は ID プロバイダからの鍵セット取得を抽象化するトレイト。
///
/// 実装は冪等かつ再試行可能でなければならない。
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    async fn fetch(&self) -> Result<JwkDocument, KeySetError>;
}

/// JwksHttpFetcher は HTTP GET で JWKS を取得するデフォルト実装。
pub struct JwksHttpFetcher {
    client: reqwest::Client,
    url: String,
}

impl JwksHttpFetcher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, KeySetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeySetError::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl KeySetFetcher for JwksHttpFetcher {
    async fn fetch(&self) -> Result<JwkDocument, KeySetError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KeySetError::Fetch(format!("failed to fetch JWKS from {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeySetError::Fetch(format!(
                "JWKS endpoint returned non-success status: {status}"
            )));
        }

        response
            .json::<JwkDocument>()
            .await
            .map_err(|e| KeySetError::InvalidKeySet(format!("failed to parse JWKS response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k1s0_test_helper::{jwks_document, TestKeyPair};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CERTS_PATH: &str = "/realms/k1s0/protocol/openid-connect/certs";

    #[tokio::test]
    async fn test_fetch_from_mock_endpoint() {
        let server = MockServer::start().await;
        let pair = TestKeyPair::rsa("k1");

        Mock::given(method("GET"))
            .and(path(CERTS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_document(&[&pair])))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = JwksHttpFetcher::new(
            &format!("{}{}", server.uri(), CERTS_PATH),
            Duration::from_secs(3),
        )
        .unwrap();
        let doc = fetcher.fetch().await.unwrap();
        assert_eq!(doc.keys.len(), 1);
        assert_eq!(doc.keys[0].kid.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(CERTS_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&server)
            .await;

        let fetcher = JwksHttpFetcher::new(
            &format!("{}{}", server.uri(), CERTS_PATH),
            Duration::from_secs(3),
        )
        .unwrap();
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, KeySetError::Fetch(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_fetch_malformed_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(CERTS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let fetcher = JwksHttpFetcher::new(
            &format!("{}{}", server.uri(), CERTS_PATH),
            Duration::from_secs(3),
        )
        .unwrap();
        assert!(matches!(
            fetcher.fetch().await,
            Err(KeySetError::InvalidKeySet(_))
        ));
    }
}

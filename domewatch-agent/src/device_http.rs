//! Device web interface client
//!
//! The dome controller answers `/?getStatus` with a `;`-separated record whose
//! third field is the absolute encoder position, and accepts `/?setEncoderA=<v>`.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use crate::config::DeviceHttpConfig;

const ENCODER_FIELD: usize = 2;

#[derive(Clone)]
pub struct DeviceHttpClient {
    http: reqwest::Client,
    base: String,
    credentials: Option<(String, String)>,
}

impl DeviceHttpClient {
    pub fn new(config: &DeviceHttpConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building device HTTP client")?;

        let base = if config.address.starts_with("http://") || config.address.starts_with("https://") {
            config.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.address)
        };

        // Basic auth seulement si quelque chose est configuré
        let credentials = if config.username.is_empty() && config.password.is_empty() {
            None
        } else {
            Some((config.username.clone(), config.password.clone()))
        };

        Ok(Self { http, base, credentials })
    }

    async fn query(&self, query: &str) -> Result<String> {
        let url = format!("{}/?{}", self.base, query);
        let mut request = self.http.get(&url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let body = request
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    /// Read the absolute encoder position
    pub async fn read_encoder(&self) -> Result<i64> {
        let body = self.query("getStatus").await?;
        parse_encoder(&body)
    }

    /// Write the absolute encoder position
    pub async fn write_encoder(&self, value: i64) -> Result<()> {
        self.query(&format!("setEncoderA={value}")).await?;
        Ok(())
    }
}

fn parse_encoder(status: &str) -> Result<i64> {
    let field = status
        .split(';')
        .nth(ENCODER_FIELD)
        .ok_or_else(|| anyhow!("status has no field {ENCODER_FIELD}: {status:?}"))?;
    field
        .trim()
        .parse::<i64>()
        .with_context(|| format!("encoder field {field:?} is not an integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, username: &str) -> DeviceHttpConfig {
        DeviceHttpConfig {
            address: server.uri(),
            username: username.to_string(),
            password: if username.is_empty() { String::new() } else { "default".to_string() },
            ..DeviceHttpConfig::default()
        }
    }

    #[test]
    fn test_parse_encoder_field() {
        assert_eq!(parse_encoder("1;0;12345;88;0").unwrap(), 12345);
        assert_eq!(parse_encoder("a;b; -42 ").unwrap(), -42);
        assert!(parse_encoder("1;2").is_err());
        assert!(parse_encoder("1;2;x").is_err());
    }

    #[tokio::test]
    async fn test_read_encoder_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("getStatus", ""))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string("0;1;5120;0"))
            .mount(&server)
            .await;

        let client = DeviceHttpClient::new(&config_for(&server, "scopedome"), Duration::from_secs(2)).unwrap();
        assert_eq!(client.read_encoder().await.unwrap(), 5120);
    }

    #[tokio::test]
    async fn test_write_encoder_without_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("setEncoderA", "5120"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeviceHttpClient::new(&config_for(&server, ""), Duration::from_secs(2)).unwrap();
        assert!(client.credentials.is_none());
        client.write_encoder(5120).await.unwrap();
    }
}

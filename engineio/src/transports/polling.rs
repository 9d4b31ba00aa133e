use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::packet::ServerErrorPacket;

/// The HTTP long-polling transport. Wraps one `reqwest` client which plays
/// the role of the session: the engine drops the transport to invalidate it,
/// while request futures already in flight keep their own handle and are
/// allowed to finish.
#[derive(Debug, Clone)]
pub struct PollingTransport {
    client: Client,
}

impl PollingTransport {
    /// Builds the transport from the engine configuration. A preconfigured
    /// `http_client` takes precedence over the assembled one.
    pub(crate) fn new(config: &EngineConfig) -> Result<Self> {
        if let Some(client) = &config.http_client {
            return Ok(PollingTransport {
                client: client.clone(),
            });
        }

        let mut builder = ClientBuilder::new();

        let headers = config.request_headers()?;
        if !headers.is_empty() {
            builder = builder.default_headers(headers);
        }
        if let Some(tls) = config.tls_connector()? {
            builder = builder.use_preconfigured_tls(tls);
        }

        Ok(PollingTransport {
            client: builder.build()?,
        })
    }

    /// Issues one long poll and returns the raw response body.
    pub(crate) async fn poll(&self, url: Url) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if status != 200 {
            // some servers reject with a structured error object
            return Err(match serde_json::from_str::<ServerErrorPacket>(&body) {
                Ok(error) => Error::InvalidHandshake(error.message),
                Err(_) => Error::IncompleteHttp(status),
            });
        }

        Ok(body)
    }

    /// Posts one encoded payload. The length prefixes inside the body count
    /// characters, but `Content-Length` is the UTF-8 byte count.
    pub(crate) async fn post(&self, url: Url, body: String) -> Result<()> {
        let status = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain; charset=UTF-8")
            .header(CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await?
            .status()
            .as_u16();

        if status != 200 {
            return Err(Error::IncompleteHttp(status));
        }

        Ok(())
    }
}

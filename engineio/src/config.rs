use std::convert::TryInto;

use native_tls::TlsConnector;
use url::Url;

use crate::error::{Error, Result};
use crate::header::HeaderMap;
use crate::ENGINE_IO_VERSION;

/// The default request path of an `engine.io` server.
pub const DEFAULT_PATH: &str = "/engine.io/";

/// Everything that shapes a single engine session: the endpoint, the query
/// parameters, transport preferences and the transport security settings.
///
/// The two transport URLs are derived from this configuration on demand so
/// that changes to `connect_params` are always reflected.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Absolute base URL of the server, scheme `http(s)` or `ws(s)`.
    pub url: Url,
    /// Path prefix the server mounts `engine.io` under.
    pub path: String,
    /// Extra key/value pairs appended to the query string of both transports.
    pub connect_params: Vec<(String, String)>,
    /// Cookies sent with polling requests and the websocket upgrade.
    pub cookies: Vec<String>,
    /// Additional headers for polling requests and the websocket upgrade.
    pub extra_headers: HeaderMap,
    /// Re-encode outgoing polling text as Latin-1-of-UTF-8 and decode
    /// incoming polling text symmetrically. Matches a historical server
    /// quirk and defaults to on.
    pub double_encode_utf8: bool,
    /// Never attempt the websocket upgrade.
    pub force_polling: bool,
    /// Skip polling entirely and connect via websocket from the start.
    pub force_websockets: bool,
    /// Force `https`/`wss` even when the base URL is plain.
    pub secure: bool,
    /// Accept self-signed server certificates.
    pub self_signed: bool,
    /// Custom TLS configuration, e.g. for certificate pinning.
    pub tls_config: Option<TlsConnector>,
    /// A preconfigured http client to run the polling session on.
    pub http_client: Option<reqwest::Client>,
}

impl EngineConfig {
    pub fn new(url: Url) -> Self {
        EngineConfig {
            url,
            path: DEFAULT_PATH.to_owned(),
            connect_params: Vec::new(),
            cookies: Vec::new(),
            extra_headers: HeaderMap::new(),
            double_encode_utf8: true,
            force_polling: false,
            force_websockets: false,
            secure: false,
            self_signed: false,
            tls_config: None,
            http_client: None,
        }
    }

    fn is_secure(&self) -> bool {
        self.secure || matches!(self.url.scheme(), "https" | "wss")
    }

    fn base_url(&self, plain: &str, secure: &str, transport: &str) -> Result<Url> {
        let mut url = self.url.clone();
        let scheme = if self.is_secure() { secure } else { plain };
        url.set_scheme(scheme)
            .map_err(|_| Error::InvalidUrlScheme(self.url.scheme().to_owned()))?;
        url.set_path(&self.path);
        url.set_query(None);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("EIO", &ENGINE_IO_VERSION.to_string());
            query.append_pair("transport", transport);
            if transport == "polling" {
                query.append_pair("b64", "1");
            }
            for (key, value) in &self.connect_params {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// The polling endpoint, with the session id appended once one exists.
    pub fn url_polling(&self, sid: &str) -> Result<Url> {
        let mut url = self.base_url("http", "https", "polling")?;
        if !sid.is_empty() {
            url.query_pairs_mut().append_pair("sid", sid);
        }
        Ok(url)
    }

    /// The websocket endpoint, with the session id appended once one exists.
    pub fn url_websocket(&self, sid: &str) -> Result<Url> {
        let mut url = self.base_url("ws", "wss", "websocket")?;
        if !sid.is_empty() {
            url.query_pairs_mut().append_pair("sid", sid);
        }
        Ok(url)
    }

    /// Headers every request carries: the configured extras plus cookies.
    pub(crate) fn request_headers(&self) -> Result<http::HeaderMap> {
        let mut headers: http::HeaderMap = self.extra_headers.clone().try_into()?;
        if !self.cookies.is_empty() {
            headers.insert(
                http::header::COOKIE,
                http::HeaderValue::from_str(&self.cookies.join("; "))?,
            );
        }
        Ok(headers)
    }

    /// The TLS connector to use, built from `tls_config` or `self_signed`.
    pub(crate) fn tls_connector(&self) -> Result<Option<TlsConnector>> {
        if let Some(tls) = &self.tls_config {
            return Ok(Some(tls.clone()));
        }
        if self.self_signed {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?;
            return Ok(Some(connector));
        }
        Ok(None)
    }
}

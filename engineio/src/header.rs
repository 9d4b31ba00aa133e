use std::convert::TryFrom;
use std::str::FromStr;

use http::{
    header::HeaderName as HttpHeaderName, HeaderMap as HttpHeaderMap,
    HeaderValue as HttpHeaderValue,
};

use crate::Error;

/// A small ordered header map so that consumers do not have to depend on the
/// `http` crate directly. Insertion order is preserved on the wire.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap::default()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl TryFrom<HeaderMap> for HttpHeaderMap {
    type Error = Error;
    fn try_from(headers: HeaderMap) -> std::result::Result<Self, Error> {
        let mut result = HttpHeaderMap::new();
        for (name, value) in headers.entries {
            result.append(
                HttpHeaderName::from_str(&name)?,
                HttpHeaderValue::from_str(&value)?,
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_http() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Request-Source", "engine");
        headers.insert("Authorization", "Bearer deadbeef");

        let http_map = HttpHeaderMap::try_from(headers).unwrap();
        assert_eq!(http_map.get("x-request-source").unwrap(), "engine");
        assert_eq!(http_map.get("authorization").unwrap(), "Bearer deadbeef");
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("bad name", "value");
        assert!(HttpHeaderMap::try_from(headers).is_err());
    }
}

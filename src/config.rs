//! Connection configuration.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::Result;
use crate::error::Error;

/// Kind of carrier used to reach the router.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed framing over a plain socket
    RawSocket,
    /// Message framing over a WebSocket
    WebSocket,
}

/// One way of reaching the router.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub url: String,
}

impl Transport {
    #[must_use]
    pub fn new<S: Into<String>>(kind: TransportKind, url: S) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }
}

/// Where and how to connect.
///
/// Transports are tried in order by components that support several.
/// Serializes as `{"realm": ..., "transports": [{"type": ..., "url": ...}]}`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Realm to join
    pub realm: String,
    pub transports: Vec<Transport>,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new<S: Into<String>>(realm: S, transports: Vec<Transport>) -> Self {
        Self {
            realm: realm.into(),
            transports,
        }
    }

    /// Config for a single router URL, see [`transports_for_url`].
    pub fn for_url<S: Into<String>>(realm: S, url: &str) -> Result<Self> {
        Ok(Self::new(realm, transports_for_url(url)?))
    }

    /// URL of the router.
    ///
    /// Not necessarily the URL that ends up being used if several transports are given.
    pub fn endpoint(&self) -> Result<&str> {
        self.transports
            .first()
            .map(|transport| transport.url.as_str())
            .ok_or_else(|| Error::validation("No transport given"))
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Ok(endpoint) => write!(f, "(realm={}, endpoint={endpoint})", self.realm),
            Err(_) => write!(f, "(realm={}, endpoint=<none>)", self.realm),
        }
    }
}

/// Transports for a router URL.
///
/// `tcp://` is read as a raw socket (`rs://`), as are `rs://` and `rss://`.
/// Every other scheme is a WebSocket.
pub fn transports_for_url(url: &str) -> Result<Vec<Transport>> {
    let url = match url.strip_prefix("tcp://") {
        Some(rest) => Url::parse(&format!("rs://{rest}"))?,
        None => Url::parse(url)?,
    };

    let kind = match url.scheme() {
        "rs" | "rss" => TransportKind::RawSocket,
        _ => TransportKind::WebSocket,
    };

    Ok(vec![Transport::new(kind, url.as_str())])
}

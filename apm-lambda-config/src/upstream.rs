use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::{Serialize, Serializer};
use url::Url;

/// Raised if a URL cannot be parsed into a [`BackendUrl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum BackendUrlError {
    /// Raised if the backend could not be parsed as URL.
    #[error("invalid backend URL: bad URL format")]
    BadUrl,
    /// Raised if an unknown or unsupported scheme is encountered.
    #[error("invalid backend URL: unknown or unsupported URL scheme")]
    UnknownScheme,
    /// Raised if no host was provided.
    #[error("invalid backend URL: no host")]
    NoHost,
    /// Raised if the URL carries a query string or fragment.
    #[error("invalid backend URL: query and fragment are not supported")]
    NotABase,
}

/// The base URL of the telemetry backend.
///
/// Unlike a plain origin, the backend may be hosted below a path prefix. The path is normalized to
/// always end with `/`, so that [`get_url`](Self::get_url) appends endpoint paths below it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackendUrl(Url);

impl BackendUrl {
    /// Returns the URL of an endpoint relative to the backend base.
    ///
    /// Leading slashes of `path` are ignored, the result is always nested below the base path.
    pub fn get_url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        // Joining a relative path onto a base URL ending in `/` cannot fail.
        self.0.join(path).unwrap_or_else(|_| self.0.clone())
    }

    /// Returns the host of the backend.
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Returns the base URL.
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl FromStr for BackendUrl {
    type Err = BackendUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut url = Url::parse(s.trim()).map_err(|_| BackendUrlError::BadUrl)?;

        match url.scheme() {
            "http" | "https" => (),
            _ => return Err(BackendUrlError::UnknownScheme),
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(BackendUrlError::NoHost);
        }

        if url.query().is_some_and(|q| !q.is_empty()) || url.fragment().is_some() {
            return Err(BackendUrlError::NotABase);
        }
        url.set_query(None);

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        Ok(Self(url))
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for BackendUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackendUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

//! Thin wrappers around `reqwest` responses used for backend requests.

use std::io;

use bytes::{Bytes, BytesMut};
#[doc(inline)]
pub use reqwest::StatusCode;
use reqwest::header::HeaderName;

/// An error performing a backend request.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The response body exceeded the read limit.
    #[error("payload too large")]
    Overflow,
    /// The request could not be sent or the response not received.
    #[error("could not send request")]
    Reqwest(#[from] reqwest::Error),
    /// The request body could not be prepared.
    #[error("failed to encode payload")]
    Io(#[from] io::Error),
}

impl HttpError {
    /// Returns `true` if the error indicates that the backend is unreachable.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::Reqwest(error) => error.is_connect() || error.is_timeout() || error.is_request(),
            Self::Io(_) => false,
            Self::Overflow => false,
        }
    }
}

/// A response from the backend.
#[derive(Debug)]
pub struct Response(pub reqwest::Response);

impl Response {
    /// Returns the status code of the response.
    pub fn status(&self) -> StatusCode {
        self.0.status()
    }

    /// Returns a header value as string, if present and valid.
    pub fn get_header(&self, key: HeaderName) -> Option<&str> {
        self.0.headers().get(key)?.to_str().ok()
    }

    /// Reads and discards the body so that the connection can be reused.
    pub async fn consume(&mut self) -> Result<(), HttpError> {
        while self.0.chunk().await?.is_some() {}
        Ok(())
    }

    /// Reads the body up to `limit` bytes.
    pub async fn bytes(self, limit: usize) -> Result<Bytes, HttpError> {
        let Self(mut response) = self;

        let mut body = BytesMut::with_capacity(limit.min(8192));
        while let Some(chunk) = response.chunk().await? {
            if (body.len() + chunk.len()) > limit {
                return Err(HttpError::Overflow);
            }

            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

use std::borrow::Cow;
use std::io::{self, Read};

use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};

/// Where a [`TelemetryUnit`] originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Submitted by the tracing agent over the local intake.
    Agent,
    /// Synthesized by the extension from platform log events.
    Platform,
}

/// Content encoding of an agent payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    /// No compression.
    #[default]
    Identity,
    /// The gzip file format.
    Gzip,
    /// A zlib stream with deflate compression.
    Deflate,
}

impl ContentEncoding {
    /// Parses a [`ContentEncoding`] from its `content-encoding` header value.
    ///
    /// Unknown encodings are treated as identity.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            Self::Gzip
        } else if value.eq_ignore_ascii_case("deflate") {
            Self::Deflate
        } else {
            Self::Identity
        }
    }

    /// Returns the value for the `content-encoding` HTTP header, `None` for identity.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
            Self::Deflate => Some("deflate"),
        }
    }
}

/// Raised if a payload cannot be decompressed.
#[derive(Debug, thiserror::Error)]
#[error("malformed {encoding} payload")]
pub struct DecodeError {
    encoding: &'static str,
    #[source]
    source: io::Error,
}

/// The unit of transfer between ingestion and transport.
#[derive(Clone, Debug)]
pub struct TelemetryUnit {
    /// The raw, possibly compressed payload.
    pub data: Bytes,
    /// Where the payload came from.
    pub origin: Origin,
    /// Compression of `data`.
    pub encoding: ContentEncoding,
    /// The agent's user agent, if the payload came from an agent.
    pub agent_info: Option<String>,
}

impl TelemetryUnit {
    /// Creates a unit for a payload received from the agent.
    pub fn agent(data: Bytes, encoding: ContentEncoding, agent_info: Option<String>) -> Self {
        Self {
            data,
            origin: Origin::Agent,
            encoding,
            agent_info,
        }
    }

    /// Creates a unit for a single uncompressed document synthesized by the extension.
    pub fn platform(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            origin: Origin::Platform,
            encoding: ContentEncoding::Identity,
            agent_info: None,
        }
    }

    /// Returns the decompressed payload.
    pub fn decode(&self) -> Result<Cow<'_, [u8]>, DecodeError> {
        decode(&self.data, self.encoding)
    }
}

/// Decompresses `data` according to `encoding`.
pub fn decode(data: &[u8], encoding: ContentEncoding) -> Result<Cow<'_, [u8]>, DecodeError> {
    let mut decoded = Vec::new();

    let result = match encoding {
        ContentEncoding::Identity => return Ok(Cow::Borrowed(data)),
        ContentEncoding::Gzip => MultiGzDecoder::new(data).read_to_end(&mut decoded),
        ContentEncoding::Deflate => ZlibDecoder::new(data).read_to_end(&mut decoded),
    };

    match result {
        Ok(_) => Ok(Cow::Owned(decoded)),
        Err(source) => Err(DecodeError {
            encoding: encoding.name().unwrap_or("identity"),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};

    use super::*;

    const NDJSON: &[u8] = b"{\"metadata\":{}}\n{\"transaction\":{\"id\":\"a\"}}\n";

    #[test]
    fn test_parse_encoding() {
        assert_eq!(ContentEncoding::parse(" GZIP "), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::parse("x-gzip"), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::parse("deflate"), ContentEncoding::Deflate);
        assert_eq!(ContentEncoding::parse("br"), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::parse(""), ContentEncoding::Identity);
    }

    #[test]
    fn test_decode_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(NDJSON).unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode(&compressed, ContentEncoding::Gzip).unwrap();
        similar_asserts::assert_eq!(decoded.as_ref(), NDJSON);
    }

    #[test]
    fn test_decode_deflate() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(NDJSON).unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode(&compressed, ContentEncoding::Deflate).unwrap();
        similar_asserts::assert_eq!(decoded.as_ref(), NDJSON);
    }

    #[test]
    fn test_identity_borrows() {
        let decoded = decode(NDJSON, ContentEncoding::Identity).unwrap();
        assert!(matches!(decoded, Cow::Borrowed(_)));
    }

    #[test]
    fn test_malformed_framing() {
        let error = decode(NDJSON, ContentEncoding::Gzip).unwrap_err();
        assert_eq!(error.to_string(), "malformed gzip payload");

        assert!(decode(b"\x78\x9c\xff\xff", ContentEncoding::Deflate).is_err());
    }
}

//! Message framing.
//!
//! Every message is one CBOR map: serial, kind, profile (requests only),
//! string properties, a compression flag and the body bytes. Requests and
//! responses are correlated by serial.

use crate::error::{ProtocolError, ProtocolResult};
use crate::profile::Profile;
use bytes::Bytes;
use ciborium::value::Value;
use std::collections::BTreeMap;
use std::io::Read;

/// Property naming the collection index (later protocol versions).
pub const PROP_COLLECTION: &str = "collection";
/// Property carrying the error domain of an error response.
pub const PROP_ERROR_DOMAIN: &str = "Error-Domain";
/// Property carrying the numeric error code of an error response.
pub const PROP_ERROR_CODE: &str = "Error-Code";

/// Error domain for HTTP-style status codes.
pub const DOMAIN_HTTP: &str = "HTTP";

/// zstd frame magic.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Whether a message is a request or a reply to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A request; carries a profile.
    Request,
    /// A successful reply.
    Response,
    /// A failed reply.
    Error,
}

impl MessageKind {
    fn code(self) -> u8 {
        match self {
            MessageKind::Request => 0,
            MessageKind::Response => 1,
            MessageKind::Error => 2,
        }
    }

    fn from_code(code: i128) -> Option<Self> {
        match code {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Correlation serial. A response reuses its request's serial.
    pub serial: u64,
    /// Request, response or error.
    pub kind: MessageKind,
    /// Profile of a request.
    pub profile: Option<String>,
    /// String properties.
    pub properties: BTreeMap<String, String>,
    /// Uncompressed body.
    pub body: Bytes,
    /// Whether the body is compressed on the wire.
    pub compressed: bool,
    /// Whether the sender expects no reply.
    pub no_reply: bool,
}

impl Message {
    /// Creates a request.
    pub fn request(profile: Profile) -> Self {
        Self {
            serial: 0,
            kind: MessageKind::Request,
            profile: Some(profile.as_str().to_string()),
            properties: BTreeMap::new(),
            body: Bytes::new(),
            compressed: false,
            no_reply: false,
        }
    }

    /// Creates an empty response to `request`.
    pub fn response_to(request: &Message) -> Self {
        Self {
            serial: request.serial,
            kind: MessageKind::Response,
            profile: None,
            properties: BTreeMap::new(),
            body: Bytes::new(),
            compressed: false,
            no_reply: true,
        }
    }

    /// Creates an error response to `request`.
    pub fn error_to(request: &Message, domain: &str, code: u16, message: &str) -> Self {
        let mut reply = Self::response_to(request);
        reply.kind = MessageKind::Error;
        reply.set_property(PROP_ERROR_DOMAIN, domain);
        reply.set_property(PROP_ERROR_CODE, code.to_string());
        reply.body = Bytes::copy_from_slice(message.as_bytes());
        reply
    }

    /// Sets a property, builder style.
    #[must_use]
    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Sets the body, builder style.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Marks the body for compression.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Marks the request as not expecting a reply.
    #[must_use]
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Sets a property.
    pub fn set_property(&mut self, name: &str, value: impl Into<String>) {
        self.properties.insert(name.to_string(), value.into());
    }

    /// Returns a property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Returns a required property.
    pub fn require(&self, name: &str) -> ProtocolResult<&str> {
        self.property(name)
            .ok_or_else(|| ProtocolError::MissingProperty(name.to_string()))
    }

    /// Parses an optional numeric property.
    pub fn u64_property(&self, name: &str) -> ProtocolResult<Option<u64>> {
        self.property(name)
            .map(|v| v.parse::<u64>().map_err(|_| ProtocolError::invalid(name, v)))
            .transpose()
    }

    /// Parses an optional boolean property (`true`/`1`).
    pub fn bool_property(&self, name: &str) -> bool {
        matches!(self.property(name), Some("true" | "1"))
    }

    /// Returns the profile as a known [`Profile`].
    pub fn known_profile(&self) -> ProtocolResult<Profile> {
        let name = self
            .profile
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingProperty("profile".into()))?;
        Profile::parse(name).ok_or_else(|| ProtocolError::UnknownProfile(name.to_string()))
    }

    /// Returns the collection index, if present.
    pub fn collection_index(&self) -> ProtocolResult<Option<usize>> {
        Ok(self.u64_property(PROP_COLLECTION)?.map(|i| i as usize))
    }

    /// Sets the collection index when one is given.
    #[must_use]
    pub fn with_collection(mut self, index: Option<usize>) -> Self {
        if let Some(index) = index {
            self.set_property(PROP_COLLECTION, index.to_string());
        }
        self
    }

    /// Returns true if this is an error response.
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    /// Returns `(domain, code)` of an error response.
    pub fn error_code(&self) -> Option<(&str, u16)> {
        if !self.is_error() {
            return None;
        }
        let domain = self.property(PROP_ERROR_DOMAIN).unwrap_or(DOMAIN_HTTP);
        let code = self
            .property(PROP_ERROR_CODE)
            .and_then(|c| c.parse().ok())
            .unwrap_or(500);
        Some((domain, code))
    }

    /// Approximate encoded size, used for byte budgets.
    pub fn approx_size(&self) -> usize {
        self.body.len()
            + self
                .properties
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum::<usize>()
            + 16
    }

    /// Encodes the message as a CBOR frame.
    pub fn encode(&self, compression_level: i32) -> ProtocolResult<Vec<u8>> {
        let body = if self.compressed && !self.body.is_empty() {
            zstd::encode_all(self.body.as_ref(), compression_level)
                .map_err(|e| ProtocolError::Compression(format!("zstd encode: {e}")))?
        } else {
            self.body.to_vec()
        };

        let mut pairs = vec![
            (Value::Text("s".into()), Value::Integer(self.serial.into())),
            (
                Value::Text("t".into()),
                Value::Integer(self.kind.code().into()),
            ),
        ];
        if let Some(profile) = &self.profile {
            pairs.push((Value::Text("p".into()), Value::Text(profile.clone())));
        }
        if !self.properties.is_empty() {
            let props = self
                .properties
                .iter()
                .map(|(k, v)| (Value::Text(k.clone()), Value::Text(v.clone())))
                .collect();
            pairs.push((Value::Text("props".into()), Value::Map(props)));
        }
        if self.compressed && !body.is_empty() {
            pairs.push((Value::Text("c".into()), Value::Bool(true)));
        }
        if self.no_reply {
            pairs.push((Value::Text("n".into()), Value::Bool(true)));
        }
        pairs.push((Value::Text("b".into()), Value::Bytes(body)));

        let mut out = Vec::new();
        ciborium::into_writer(&Value::Map(pairs), &mut out)
            .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
        Ok(out)
    }

    /// Decodes a CBOR frame.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decoding(e.to_string()))?;
        let Value::Map(map) = value else {
            return Err(ProtocolError::Decoding("expected map".into()));
        };

        let get_field = |name: &str| {
            map.iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v)
        };

        let serial = get_field("s")
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| ProtocolError::Decoding("missing serial".into()))?;

        let kind = get_field("t")
            .and_then(|v| v.as_integer())
            .and_then(|i| MessageKind::from_code(i128::from(i)))
            .ok_or_else(|| ProtocolError::Decoding("missing or invalid kind".into()))?;

        let profile = get_field("p").and_then(|v| v.as_text()).map(str::to_string);
        if kind == MessageKind::Request && profile.is_none() {
            return Err(ProtocolError::Decoding("request without profile".into()));
        }

        let mut properties = BTreeMap::new();
        if let Some(props) = get_field("props") {
            let entries = props
                .as_map()
                .ok_or_else(|| ProtocolError::Decoding("properties must be a map".into()))?;
            for (k, v) in entries {
                match (k.as_text(), v.as_text()) {
                    (Some(k), Some(v)) => {
                        properties.insert(k.to_string(), v.to_string());
                    }
                    _ => return Err(ProtocolError::Decoding("non-text property".into())),
                }
            }
        }

        let compressed = get_field("c").and_then(|v| v.as_bool()).unwrap_or(false);
        let no_reply = get_field("n").and_then(|v| v.as_bool()).unwrap_or(false);
        let raw = get_field("b")
            .and_then(|v| v.as_bytes())
            .map(|b| b.as_slice())
            .unwrap_or_default();
        let body = if compressed {
            decompress(raw)?
        } else {
            raw.to_vec()
        };

        Ok(Self {
            serial,
            kind,
            profile,
            properties,
            body: Bytes::from(body),
            compressed,
            no_reply,
        })
    }
}

fn decompress(data: &[u8]) -> ProtocolResult<Vec<u8>> {
    if data.len() < 4 || data[..4] != ZSTD_MAGIC {
        return Err(ProtocolError::Compression("missing zstd header".into()));
    }
    let mut decoder = zstd::Decoder::new(data)
        .map_err(|e| ProtocolError::Compression(format!("zstd init: {e}")))?;
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(format!("zstd decode: {e}")))?;
    Ok(out)
}

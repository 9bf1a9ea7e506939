//! ClientHello layout model and wire parser.
//!
//! A [`ClientHelloSpec`] is what the egress side replays: ordered cipher suites, ordered
//! extensions and the contents of the extensions that shape a fingerprint. GREASE values
//! are collapsed to [`GREASE_PLACEHOLDER`] so two hellos from the same client stack compare
//! equal even though the real GREASE values are random per connection.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use mimic_traits::{HandshakeDescription, ParseError};

pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

pub const TLS1_0: u16 = 0x0301;
pub const TLS1_1: u16 = 0x0302;
pub const TLS1_2: u16 = 0x0303;
pub const TLS1_3: u16 = 0x0304;

/// Extension type codepoints the parser and the TLS layer care about.
pub mod ext {
    pub const SERVER_NAME: u16 = 0;
    pub const STATUS_REQUEST: u16 = 5;
    pub const SUPPORTED_GROUPS: u16 = 10;
    pub const EC_POINT_FORMATS: u16 = 11;
    pub const SIGNATURE_ALGORITHMS: u16 = 13;
    pub const ALPN: u16 = 16;
    pub const SIGNED_CERT_TIMESTAMP: u16 = 18;
    pub const PADDING: u16 = 21;
    pub const EXTENDED_MASTER_SECRET: u16 = 23;
    pub const COMPRESS_CERTIFICATE: u16 = 27;
    pub const RECORD_SIZE_LIMIT: u16 = 28;
    pub const DELEGATED_CREDENTIALS: u16 = 34;
    pub const SESSION_TICKET: u16 = 35;
    pub const SUPPORTED_VERSIONS: u16 = 43;
    pub const PSK_KEY_EXCHANGE_MODES: u16 = 45;
    pub const KEY_SHARE: u16 = 51;
    pub const APPLICATION_SETTINGS: u16 = 17513;
    pub const ENCRYPTED_CLIENT_HELLO: u16 = 65037;
    pub const RENEGOTIATION_INFO: u16 = 65281;
}

/// RFC 8701 GREASE values (`0x?a?a`).
pub fn is_grease(value: u16) -> bool {
    let hi = (value >> 8) as u8;
    let lo = value as u8;
    hi == lo && (hi & 0x0f) == 0x0a
}

fn normalize(value: u16) -> u16 {
    if is_grease(value) {
        GREASE_PLACEHOLDER
    } else {
        value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Extension {
    pub kind: u16,
    /// Raw extension body; empty for canned profiles where the body is derived from the
    /// typed fields.
    pub data: Bytes,
}

impl Extension {
    pub fn empty(kind: u16) -> Self {
        Self {
            kind,
            data: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHelloSpec {
    pub legacy_version: u16,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub signature_algorithms: Vec<u16>,
    pub alpn_protocols: Vec<String>,
    pub supported_versions: Vec<u16>,
    pub key_share_groups: Vec<u16>,
    /// Extension order is shuffled per connection by the impersonated client.
    pub permute_extensions: bool,
}

/// The part of a [`ClientHelloSpec`] that shapes a TLS client configuration.
///
/// Per-connection material (key shares, SNI, padding, PSK identities) lives in extension bodies
/// and is left out, so every hello from one client stack maps to the same layout. Extension
/// kinds are kept as a set since permuting clients reorder them on each connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HelloLayout {
    pub cipher_suites: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub alpn_protocols: Vec<String>,
    pub min_version: u16,
    pub max_version: u16,
    pub extension_kinds: BTreeSet<u16>,
    pub grease: bool,
    pub permute_extensions: bool,
}

impl Default for ClientHelloSpec {
    fn default() -> Self {
        Self {
            legacy_version: TLS1_2,
            cipher_suites: Vec::new(),
            compression_methods: vec![0],
            extensions: Vec::new(),
            supported_groups: Vec::new(),
            ec_point_formats: Vec::new(),
            signature_algorithms: Vec::new(),
            alpn_protocols: Vec::new(),
            supported_versions: Vec::new(),
            key_share_groups: Vec::new(),
            permute_extensions: false,
        }
    }
}

impl ClientHelloSpec {
    pub fn layout(&self) -> HelloLayout {
        HelloLayout {
            cipher_suites: self.cipher_suites.clone(),
            supported_groups: self.supported_groups.clone(),
            signature_algorithms: self.signature_algorithms.clone(),
            alpn_protocols: self.alpn_protocols.clone(),
            min_version: self.min_version(),
            max_version: self.max_version(),
            extension_kinds: self.extensions.iter().map(|e| e.kind).collect(),
            grease: self.uses_grease(),
            permute_extensions: self.permute_extensions,
        }
    }

    pub fn extension_order(&self) -> Vec<u16> {
        self.extensions.iter().map(|e| e.kind).collect()
    }

    pub fn has_extension(&self, kind: u16) -> bool {
        self.extensions.iter().any(|e| e.kind == kind)
    }

    pub fn uses_grease(&self) -> bool {
        self.cipher_suites.iter().any(|&c| is_grease(c))
            || self.extensions.iter().any(|e| is_grease(e.kind))
            || self.supported_groups.iter().any(|&g| is_grease(g))
    }

    fn versions(&self) -> Vec<u16> {
        let versions: Vec<u16> = self
            .supported_versions
            .iter()
            .copied()
            .filter(|&v| !is_grease(v))
            .collect();
        if versions.is_empty() {
            vec![self.legacy_version]
        } else {
            versions
        }
    }

    pub fn min_version(&self) -> u16 {
        self.versions().into_iter().min().unwrap_or(TLS1_2)
    }

    pub fn max_version(&self) -> u16 {
        self.versions().into_iter().max().unwrap_or(TLS1_2)
    }

    /// SNI carried in the server_name extension, if any.
    pub fn server_name(&self) -> Option<String> {
        let ext = self
            .extensions
            .iter()
            .find(|e| e.kind == ext::SERVER_NAME && !e.data.is_empty())?;
        let mut list = Reader::new(&ext.data, 0);
        let len = list.u16("server name list length").ok()? as usize;
        let mut entries = list.sub(len, "server name list").ok()?;
        while entries.remaining() > 0 {
            let name_type = entries.u8("name type").ok()?;
            let name_len = entries.u16("name length").ok()? as usize;
            let name = entries.take(name_len, "host name").ok()?;
            if name_type == 0 {
                return std::str::from_utf8(name).ok().map(str::to_string);
            }
        }
        None
    }

    /// JA3 text form: `version,ciphers,extensions,groups,point_formats`, GREASE excluded.
    pub fn ja3_string(&self) -> String {
        fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
            values.map(|v| v.to_string()).collect::<Vec<_>>().join("-")
        }

        format!(
            "{},{},{},{},{}",
            self.legacy_version,
            join(self.cipher_suites.iter().filter(|c| !is_grease(**c))),
            join(self.extensions.iter().map(|e| e.kind).filter(|k| !is_grease(*k))),
            join(self.supported_groups.iter().filter(|g| !is_grease(**g))),
            join(self.ec_point_formats.iter()),
        )
    }

    /// Encodes the layout as a single TLS record with a zeroed random and no session id.
    pub fn encode(&self) -> HandshakeDescription {
        let mut body = BytesMut::new();
        body.put_u16(self.legacy_version);
        body.put_slice(&[0u8; 32]);
        body.put_u8(0);
        body.put_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            body.put_u16(*suite);
        }
        body.put_u8(self.compression_methods.len() as u8);
        body.put_slice(&self.compression_methods);

        if !self.extensions.is_empty() {
            let mut exts = BytesMut::new();
            for ext in &self.extensions {
                let data = self.extension_body(ext);
                exts.put_u16(ext.kind);
                exts.put_u16(data.len() as u16);
                exts.put_slice(&data);
            }
            body.put_u16(exts.len() as u16);
            body.put_slice(&exts);
        }

        let mut record = BytesMut::with_capacity(body.len() + 9);
        record.put_u8(RECORD_TYPE_HANDSHAKE);
        record.put_u16(TLS1_0);
        record.put_u16((body.len() + 4) as u16);
        record.put_u8(HANDSHAKE_TYPE_CLIENT_HELLO);
        record.put_uint(body.len() as u64, 3);
        record.put_slice(&body);
        HandshakeDescription::new(record.freeze())
    }

    fn extension_body(&self, ext: &Extension) -> Bytes {
        if !ext.data.is_empty() {
            return ext.data.clone();
        }

        let mut out = BytesMut::new();
        match ext.kind {
            ext::SUPPORTED_GROUPS => put_u16_list(&mut out, &self.supported_groups),
            ext::EC_POINT_FORMATS => {
                out.put_u8(self.ec_point_formats.len() as u8);
                out.put_slice(&self.ec_point_formats);
            }
            ext::SIGNATURE_ALGORITHMS => put_u16_list(&mut out, &self.signature_algorithms),
            ext::ALPN => {
                let mut list = BytesMut::new();
                for proto in &self.alpn_protocols {
                    list.put_u8(proto.len() as u8);
                    list.put_slice(proto.as_bytes());
                }
                out.put_u16(list.len() as u16);
                out.put_slice(&list);
            }
            ext::SUPPORTED_VERSIONS => {
                out.put_u8((self.supported_versions.len() * 2) as u8);
                for version in &self.supported_versions {
                    out.put_u16(*version);
                }
            }
            ext::KEY_SHARE => {
                let mut shares = BytesMut::new();
                for group in &self.key_share_groups {
                    shares.put_u16(*group);
                    shares.put_u16(0);
                }
                out.put_u16(shares.len() as u16);
                out.put_slice(&shares);
            }
            ext::PSK_KEY_EXCHANGE_MODES => out.put_slice(&[1, 1]),
            _ => {}
        }
        out.freeze()
    }
}

fn put_u16_list(out: &mut BytesMut, values: &[u16]) {
    out.put_u16((values.len() * 2) as u16);
    for value in values {
        out.put_u16(*value);
    }
}

/// Bounds-checked big-endian reader that remembers absolute offsets for error reporting.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::new(
                self.offset(),
                format!("truncated {what}: need {n} bytes, have {}", self.remaining()),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn sub(&mut self, n: usize, what: &str) -> Result<Reader<'a>, ParseError> {
        let base = self.offset();
        Ok(Reader::new(self.take(n, what)?, base))
    }

    fn u8(&mut self, what: &str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, ParseError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &str) -> Result<u32, ParseError> {
        let b = self.take(3, what)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn u16_list(&mut self, len: usize, what: &str) -> Result<Vec<u16>, ParseError> {
        if len % 2 != 0 {
            return Err(ParseError::new(self.offset(), format!("odd {what} length {len}")));
        }
        let mut list = self.sub(len, what)?;
        let mut out = Vec::with_capacity(len / 2);
        while list.remaining() > 0 {
            out.push(normalize(list.u16(what)?));
        }
        Ok(out)
    }
}

/// Length of the TLS records holding one complete ClientHello at the start of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed.
pub fn complete_hello_len(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    let mut reader = Reader::new(buf, 0);
    let mut message_len = 0usize;
    let mut expected: Option<usize> = None;

    loop {
        if reader.remaining() < 5 {
            return Ok(None);
        }
        let kind = reader.u8("record type")?;
        if kind != RECORD_TYPE_HANDSHAKE {
            return Err(ParseError::new(
                reader.offset() - 1,
                format!("record type {kind:#04x} is not a handshake"),
            ));
        }
        reader.u16("record version")?;
        let len = reader.u16("record length")? as usize;
        if len == 0 {
            return Err(ParseError::new(reader.offset() - 2, "empty handshake record"));
        }
        let record_start = reader.offset();
        if reader.remaining() < len {
            return Ok(None);
        }
        if expected.is_none() {
            let fragment = &buf[record_start..record_start + len];
            if fragment[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
                return Err(ParseError::new(record_start, "handshake is not a ClientHello"));
            }
            if fragment.len() < 4 {
                return Err(ParseError::new(record_start, "handshake header split across records"));
            }
            let body_len = u32::from_be_bytes([0, fragment[1], fragment[2], fragment[3]]) as usize;
            expected = Some(body_len + 4);
        }
        reader.take(len, "record fragment")?;
        message_len += len;
        if let Some(total) = expected {
            if message_len >= total {
                return Ok(Some(reader.offset()));
            }
        }
    }
}

/// Parses a literal handshake description into a replayable layout.
pub fn parse(description: &HandshakeDescription) -> Result<ClientHelloSpec, ParseError> {
    let data = description.as_bytes();
    match data.first() {
        None => Err(ParseError::new(0, "empty client hello")),
        Some(&RECORD_TYPE_HANDSHAKE) => {
            let total = complete_hello_len(data)?
                .ok_or_else(|| ParseError::new(data.len(), "incomplete client hello record"))?;
            let mut records = Reader::new(&data[..total], 0);
            let mut message = Vec::with_capacity(total);
            while records.remaining() > 0 {
                records.take(3, "record header")?;
                let len = records.u16("record length")? as usize;
                message.extend_from_slice(records.take(len, "record fragment")?);
            }
            parse_handshake(&message, 5)
        }
        Some(&HANDSHAKE_TYPE_CLIENT_HELLO) => parse_handshake(data, 0),
        Some(other) => Err(ParseError::new(
            0,
            format!("unexpected leading byte {other:#04x}"),
        )),
    }
}

fn parse_handshake(message: &[u8], base: usize) -> Result<ClientHelloSpec, ParseError> {
    let mut reader = Reader::new(message, base);
    let kind = reader.u8("handshake type")?;
    if kind != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(ParseError::new(base, format!("handshake type {kind} is not a ClientHello")));
    }
    let len = reader.u24("handshake length")? as usize;
    let mut body = reader.sub(len, "client hello body")?;

    let mut spec = ClientHelloSpec {
        legacy_version: body.u16("legacy version")?,
        compression_methods: Vec::new(),
        ..Default::default()
    };
    body.take(32, "random")?;

    let session_id_len = body.u8("session id length")? as usize;
    if session_id_len > 32 {
        return Err(ParseError::new(
            body.offset() - 1,
            format!("session id length {session_id_len} exceeds 32"),
        ));
    }
    body.take(session_id_len, "session id")?;

    let suites_len = body.u16("cipher suites length")? as usize;
    if suites_len == 0 {
        return Err(ParseError::new(body.offset() - 2, "no cipher suites"));
    }
    spec.cipher_suites = body.u16_list(suites_len, "cipher suites")?;

    let compression_len = body.u8("compression methods length")? as usize;
    if compression_len == 0 {
        return Err(ParseError::new(body.offset() - 1, "no compression methods"));
    }
    spec.compression_methods = body.take(compression_len, "compression methods")?.to_vec();

    if body.remaining() == 0 {
        return Ok(spec);
    }

    let extensions_len = body.u16("extensions length")? as usize;
    let mut extensions = body.sub(extensions_len, "extensions")?;
    if body.remaining() != 0 {
        return Err(ParseError::new(
            body.offset(),
            format!("{} trailing bytes after extensions", body.remaining()),
        ));
    }

    while extensions.remaining() > 0 {
        let kind_offset = extensions.offset();
        let kind = normalize(extensions.u16("extension type")?);
        let len = extensions.u16("extension length")? as usize;
        let data_offset = extensions.offset();
        let raw = extensions.take(len, "extension body")?;

        if kind != GREASE_PLACEHOLDER && spec.has_extension(kind) {
            return Err(ParseError::new(kind_offset, format!("duplicate extension {kind}")));
        }

        let mut data = Reader::new(raw, data_offset);
        match kind {
            ext::SUPPORTED_GROUPS => {
                let n = data.u16("supported groups length")? as usize;
                spec.supported_groups = data.u16_list(n, "supported groups")?;
            }
            ext::EC_POINT_FORMATS => {
                let n = data.u8("point formats length")? as usize;
                spec.ec_point_formats = data.take(n, "point formats")?.to_vec();
            }
            ext::SIGNATURE_ALGORITHMS => {
                let n = data.u16("signature algorithms length")? as usize;
                spec.signature_algorithms = data.u16_list(n, "signature algorithms")?;
            }
            ext::ALPN => {
                let n = data.u16("alpn length")? as usize;
                let mut list = data.sub(n, "alpn list")?;
                while list.remaining() > 0 {
                    let proto_len = list.u8("protocol length")? as usize;
                    let proto = list.take(proto_len, "protocol name")?;
                    spec.alpn_protocols
                        .push(String::from_utf8_lossy(proto).into_owned());
                }
            }
            ext::SUPPORTED_VERSIONS => {
                let n = data.u8("supported versions length")? as usize;
                spec.supported_versions = data.u16_list(n, "supported versions")?;
            }
            ext::KEY_SHARE => {
                let n = data.u16("key share length")? as usize;
                let mut shares = data.sub(n, "key shares")?;
                while shares.remaining() > 0 {
                    spec.key_share_groups
                        .push(normalize(shares.u16("key share group")?));
                    let key_len = shares.u16("key exchange length")? as usize;
                    shares.take(key_len, "key exchange")?;
                }
            }
            _ => {}
        }

        spec.extensions.push(Extension {
            kind,
            data: Bytes::copy_from_slice(raw),
        });
    }

    Ok(spec)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small but complete hello: GREASE, SNI, groups, sigalgs, ALPN, versions, key share.
    pub(crate) fn sample_spec(server: &str) -> ClientHelloSpec {
        let mut sni = BytesMut::new();
        sni.put_u16((server.len() + 3) as u16);
        sni.put_u8(0);
        sni.put_u16(server.len() as u16);
        sni.put_slice(server.as_bytes());

        ClientHelloSpec {
            cipher_suites: vec![0x3a3a, 0x1301, 0x1302, 0xc02b, 0xc02f],
            extensions: vec![
                Extension::empty(0x2a2a),
                Extension {
                    kind: ext::SERVER_NAME,
                    data: sni.freeze(),
                },
                Extension::empty(ext::EXTENDED_MASTER_SECRET),
                Extension::empty(ext::SUPPORTED_GROUPS),
                Extension::empty(ext::EC_POINT_FORMATS),
                Extension::empty(ext::SIGNATURE_ALGORITHMS),
                Extension::empty(ext::ALPN),
                Extension::empty(ext::SUPPORTED_VERSIONS),
                Extension::empty(ext::KEY_SHARE),
            ],
            supported_groups: vec![0x4a4a, 29, 23],
            ec_point_formats: vec![0],
            signature_algorithms: vec![0x0403, 0x0804, 0x0401],
            alpn_protocols: vec!["h2".into(), "http/1.1".into()],
            supported_versions: vec![TLS1_3, TLS1_2],
            key_share_groups: vec![29],
            ..Default::default()
        }
    }

    fn with_key_share(spec: &ClientHelloSpec, key_byte: u8) -> HandshakeDescription {
        let mut share = BytesMut::new();
        share.put_u16(36);
        share.put_u16(29);
        share.put_u16(32);
        share.put_slice(&[key_byte; 32]);
        let mut spec = spec.clone();
        for extension in spec.extensions.iter_mut().filter(|e| e.kind == ext::KEY_SHARE) {
            extension.data = share.clone().freeze();
        }
        spec.encode()
    }

    #[test]
    fn layout_ignores_per_connection_material() {
        let a = parse(&with_key_share(&sample_spec("example.com"), 1)).unwrap();
        let b = parse(&with_key_share(&sample_spec("other.test"), 2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.ja3_string(), b.ja3_string());
        assert_eq!(a.layout(), b.layout());

        let mut permuted = a.clone();
        permuted.extensions.reverse();
        assert_eq!(permuted.layout(), a.layout());

        let mut fewer_suites = a.clone();
        fewer_suites.cipher_suites.pop();
        assert_ne!(fewer_suites.layout(), a.layout());
    }

    #[test]
    fn grease_detection() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x0a0b));
        assert!(!is_grease(0x1301));
    }

    #[test]
    fn parses_encoded_hello() {
        let spec = sample_spec("example.com");
        let parsed = parse(&spec.encode()).unwrap();

        assert_eq!(parsed.legacy_version, TLS1_2);
        assert_eq!(parsed.cipher_suites, vec![GREASE_PLACEHOLDER, 0x1301, 0x1302, 0xc02b, 0xc02f]);
        assert_eq!(parsed.extension_order()[0], GREASE_PLACEHOLDER);
        assert_eq!(parsed.supported_groups, vec![GREASE_PLACEHOLDER, 29, 23]);
        assert_eq!(parsed.signature_algorithms, spec.signature_algorithms);
        assert_eq!(parsed.alpn_protocols, vec!["h2", "http/1.1"]);
        assert_eq!(parsed.supported_versions, vec![TLS1_3, TLS1_2]);
        assert_eq!(parsed.key_share_groups, vec![29]);
        assert_eq!(parsed.server_name().as_deref(), Some("example.com"));
        assert_eq!(parsed.max_version(), TLS1_3);
        assert_eq!(parsed.min_version(), TLS1_2);
        assert!(parsed.uses_grease());
    }

    #[test]
    fn bare_handshake_message_is_accepted() {
        let record = sample_spec("a.test").encode();
        let bare = HandshakeDescription::new(record.as_bytes()[5..].to_vec());
        assert_eq!(parse(&bare).unwrap(), parse(&record).unwrap());
    }

    #[test]
    fn ja3_skips_grease() {
        let spec = sample_spec("example.com");
        assert_eq!(
            spec.ja3_string(),
            "771,4865-4866-49195-49199,0-23-10-11-13-16-43-51,29-23,0"
        );
    }

    #[test]
    fn truncated_hello_reports_offset() {
        let full = sample_spec("example.com").encode();
        let bytes = full.as_bytes();
        // Keep the record header claiming the full length but drop the tail.
        let cut = HandshakeDescription::new(bytes[..bytes.len() - 10].to_vec());
        let err = parse(&cut).unwrap_err();
        assert_eq!(err.offset, cut.len());

        let bare = HandshakeDescription::new(bytes[5..bytes.len() - 10].to_vec());
        let err = parse(&bare).unwrap_err();
        assert!(err.reason.contains("truncated client hello body"), "{err}");
    }

    #[test]
    fn rejects_non_handshake_input() {
        let err = parse(&HandshakeDescription::new(vec![0x17, 0x03, 0x03, 0x00, 0x01, 0x00]))
            .unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(parse(&HandshakeDescription::new(Vec::new())).is_err());
    }

    #[test]
    fn rejects_duplicate_extensions() {
        let mut spec = sample_spec("example.com");
        spec.extensions.push(Extension::empty(ext::EXTENDED_MASTER_SECRET));
        let err = parse(&spec.encode()).unwrap_err();
        assert!(err.reason.contains("duplicate extension 23"));
    }

    #[test]
    fn record_length_detection() {
        let encoded = sample_spec("example.com").encode();
        let bytes = encoded.as_bytes();
        assert_eq!(complete_hello_len(&bytes[..3]).unwrap(), None);
        assert_eq!(complete_hello_len(&bytes[..bytes.len() - 1]).unwrap(), None);
        assert_eq!(complete_hello_len(bytes).unwrap(), Some(bytes.len()));

        let mut with_trailer = bytes.to_vec();
        with_trailer.extend_from_slice(b"GET / HTTP/1.1");
        assert_eq!(complete_hello_len(&with_trailer).unwrap(), Some(bytes.len()));

        assert!(complete_hello_len(b"GET / HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn hello_split_across_records() {
        let encoded = sample_spec("split.test").encode();
        let message = &encoded.as_bytes()[5..];
        let (first, second) = message.split_at(20);

        let mut records = Vec::new();
        for fragment in [first, second] {
            records.push(RECORD_TYPE_HANDSHAKE);
            records.extend_from_slice(&TLS1_0.to_be_bytes());
            records.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
            records.extend_from_slice(fragment);
        }

        assert_eq!(complete_hello_len(&records).unwrap(), Some(records.len()));
        let parsed = parse(&HandshakeDescription::new(records)).unwrap();
        assert_eq!(parsed.server_name().as_deref(), Some("split.test"));
    }
}

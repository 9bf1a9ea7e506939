//! Canned handshake layouts for the named fingerprint profiles.

use crate::hello::{
    ext, ClientHelloSpec, Extension, GREASE_PLACEHOLDER, TLS1_0, TLS1_1, TLS1_2, TLS1_3,
};

const G: u16 = GREASE_PLACEHOLDER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedProfile {
    Default,
    Chrome100,
    Chrome106,
    Chrome120,
    Firefox102,
    Firefox120,
    Safari16,
    Edge106,
    Ios14,
    Android11OkHttp,
}

impl NamedProfile {
    pub const ALL: [NamedProfile; 10] = [
        NamedProfile::Default,
        NamedProfile::Chrome100,
        NamedProfile::Chrome106,
        NamedProfile::Chrome120,
        NamedProfile::Firefox102,
        NamedProfile::Firefox120,
        NamedProfile::Safari16,
        NamedProfile::Edge106,
        NamedProfile::Ios14,
        NamedProfile::Android11OkHttp,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            NamedProfile::Default => "Default",
            NamedProfile::Chrome100 => "Chrome100",
            NamedProfile::Chrome106 => "Chrome106",
            NamedProfile::Chrome120 => "Chrome120",
            NamedProfile::Firefox102 => "Firefox102",
            NamedProfile::Firefox120 => "Firefox120",
            NamedProfile::Safari16 => "Safari16_0",
            NamedProfile::Edge106 => "Edge106",
            NamedProfile::Ios14 => "iOS14",
            NamedProfile::Android11OkHttp => "Android11OkHttp",
        }
    }

    /// Case-insensitive lookup by label. An empty name selects [`NamedProfile::Default`].
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Some(NamedProfile::Default);
        }
        Self::ALL
            .into_iter()
            .find(|p| p.label().eq_ignore_ascii_case(name))
    }

    pub fn spec(&self) -> ClientHelloSpec {
        self.layout().to_spec()
    }

    fn layout(&self) -> &'static Layout {
        match self {
            NamedProfile::Default => &DEFAULT,
            NamedProfile::Chrome100 => &CHROME_100,
            NamedProfile::Chrome106 => &CHROME_106,
            NamedProfile::Chrome120 => &CHROME_120,
            NamedProfile::Firefox102 => &FIREFOX_102,
            NamedProfile::Firefox120 => &FIREFOX_120,
            NamedProfile::Safari16 => &SAFARI_16,
            NamedProfile::Edge106 => &EDGE_106,
            NamedProfile::Ios14 => &IOS_14,
            NamedProfile::Android11OkHttp => &ANDROID_11_OKHTTP,
        }
    }
}

struct Layout {
    ciphers: &'static [u16],
    extensions: &'static [u16],
    groups: &'static [u16],
    sigalgs: &'static [u16],
    alpn: &'static [&'static str],
    versions: &'static [u16],
    key_shares: &'static [u16],
    permute: bool,
}

impl Layout {
    fn to_spec(&self) -> ClientHelloSpec {
        let point_formats = if self.extensions.contains(&ext::EC_POINT_FORMATS) {
            vec![0]
        } else {
            Vec::new()
        };

        ClientHelloSpec {
            legacy_version: TLS1_2,
            cipher_suites: self.ciphers.to_vec(),
            compression_methods: vec![0],
            extensions: self.extensions.iter().map(|&k| Extension::empty(k)).collect(),
            supported_groups: self.groups.to_vec(),
            ec_point_formats: point_formats,
            signature_algorithms: self.sigalgs.to_vec(),
            alpn_protocols: self.alpn.iter().map(|p| p.to_string()).collect(),
            supported_versions: self.versions.to_vec(),
            key_share_groups: self.key_shares.to_vec(),
            permute_extensions: self.permute,
        }
    }
}

const CHROME_CIPHERS: &[u16] = &[
    G, 0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
    0x009c, 0x009d, 0x002f, 0x0035,
];

const CHROME_SIGALGS: &[u16] = &[0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601];

const CHROME_100_EXTENSIONS: &[u16] = &[
    G,
    ext::SERVER_NAME,
    ext::EXTENDED_MASTER_SECRET,
    ext::RENEGOTIATION_INFO,
    ext::SUPPORTED_GROUPS,
    ext::EC_POINT_FORMATS,
    ext::SESSION_TICKET,
    ext::ALPN,
    ext::STATUS_REQUEST,
    ext::SIGNATURE_ALGORITHMS,
    ext::SIGNED_CERT_TIMESTAMP,
    ext::KEY_SHARE,
    ext::PSK_KEY_EXCHANGE_MODES,
    ext::SUPPORTED_VERSIONS,
    ext::COMPRESS_CERTIFICATE,
    ext::APPLICATION_SETTINGS,
    G,
    ext::PADDING,
];

const CHROME_120_EXTENSIONS: &[u16] = &[
    G,
    ext::SERVER_NAME,
    ext::EXTENDED_MASTER_SECRET,
    ext::RENEGOTIATION_INFO,
    ext::SUPPORTED_GROUPS,
    ext::EC_POINT_FORMATS,
    ext::SESSION_TICKET,
    ext::ALPN,
    ext::STATUS_REQUEST,
    ext::SIGNATURE_ALGORITHMS,
    ext::SIGNED_CERT_TIMESTAMP,
    ext::KEY_SHARE,
    ext::PSK_KEY_EXCHANGE_MODES,
    ext::SUPPORTED_VERSIONS,
    ext::COMPRESS_CERTIFICATE,
    ext::APPLICATION_SETTINGS,
    ext::ENCRYPTED_CLIENT_HELLO,
    G,
];

const DEFAULT: Layout = Layout {
    ciphers: &[
        0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc009, 0xc013,
        0xc00a, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
    ],
    extensions: &[
        ext::SERVER_NAME,
        ext::EXTENDED_MASTER_SECRET,
        ext::RENEGOTIATION_INFO,
        ext::SUPPORTED_GROUPS,
        ext::EC_POINT_FORMATS,
        ext::SESSION_TICKET,
        ext::ALPN,
        ext::SIGNATURE_ALGORITHMS,
        ext::KEY_SHARE,
        ext::PSK_KEY_EXCHANGE_MODES,
        ext::SUPPORTED_VERSIONS,
    ],
    groups: &[29, 23, 24],
    sigalgs: &[0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601, 0x0201],
    alpn: &["h2", "http/1.1"],
    versions: &[TLS1_3, TLS1_2],
    key_shares: &[29],
    permute: false,
};

const CHROME_100: Layout = Layout {
    ciphers: CHROME_CIPHERS,
    extensions: CHROME_100_EXTENSIONS,
    groups: &[G, 29, 23, 24],
    sigalgs: CHROME_SIGALGS,
    alpn: &["h2", "http/1.1"],
    versions: &[G, TLS1_3, TLS1_2],
    key_shares: &[G, 29],
    permute: false,
};

const CHROME_106: Layout = Layout {
    permute: true,
    ..CHROME_100
};

const CHROME_120: Layout = Layout {
    extensions: CHROME_120_EXTENSIONS,
    permute: true,
    ..CHROME_100
};

const EDGE_106: Layout = Layout {
    permute: false,
    ..CHROME_100
};

const FIREFOX_CIPHERS: &[u16] = &[
    0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009,
    0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
];

const FIREFOX_SIGALGS: &[u16] = &[
    0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203, 0x0201,
];

const FIREFOX_102: Layout = Layout {
    ciphers: FIREFOX_CIPHERS,
    extensions: &[
        ext::SERVER_NAME,
        ext::EXTENDED_MASTER_SECRET,
        ext::RENEGOTIATION_INFO,
        ext::SUPPORTED_GROUPS,
        ext::EC_POINT_FORMATS,
        ext::SESSION_TICKET,
        ext::ALPN,
        ext::STATUS_REQUEST,
        ext::DELEGATED_CREDENTIALS,
        ext::KEY_SHARE,
        ext::SUPPORTED_VERSIONS,
        ext::SIGNATURE_ALGORITHMS,
        ext::PSK_KEY_EXCHANGE_MODES,
        ext::RECORD_SIZE_LIMIT,
        ext::PADDING,
    ],
    groups: &[29, 23, 24, 25, 256, 257],
    sigalgs: FIREFOX_SIGALGS,
    alpn: &["h2", "http/1.1"],
    versions: &[TLS1_3, TLS1_2],
    key_shares: &[29, 23],
    permute: false,
};

const FIREFOX_120: Layout = Layout {
    extensions: &[
        ext::SERVER_NAME,
        ext::EXTENDED_MASTER_SECRET,
        ext::RENEGOTIATION_INFO,
        ext::SUPPORTED_GROUPS,
        ext::EC_POINT_FORMATS,
        ext::SESSION_TICKET,
        ext::ALPN,
        ext::STATUS_REQUEST,
        ext::DELEGATED_CREDENTIALS,
        ext::KEY_SHARE,
        ext::SUPPORTED_VERSIONS,
        ext::SIGNATURE_ALGORITHMS,
        ext::PSK_KEY_EXCHANGE_MODES,
        ext::RECORD_SIZE_LIMIT,
        ext::ENCRYPTED_CLIENT_HELLO,
    ],
    ..FIREFOX_102
};

const SAFARI_CIPHERS: &[u16] = &[
    G, 0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc00a, 0xc009,
    0xc014, 0xc013, 0x009d, 0x009c, 0x0035, 0x002f, 0xc008, 0xc012, 0x000a,
];

const SAFARI_16: Layout = Layout {
    ciphers: SAFARI_CIPHERS,
    extensions: &[
        G,
        ext::SERVER_NAME,
        ext::EXTENDED_MASTER_SECRET,
        ext::RENEGOTIATION_INFO,
        ext::SUPPORTED_GROUPS,
        ext::EC_POINT_FORMATS,
        ext::ALPN,
        ext::STATUS_REQUEST,
        ext::SIGNATURE_ALGORITHMS,
        ext::SIGNED_CERT_TIMESTAMP,
        ext::KEY_SHARE,
        ext::PSK_KEY_EXCHANGE_MODES,
        ext::SUPPORTED_VERSIONS,
        ext::COMPRESS_CERTIFICATE,
        G,
        ext::PADDING,
    ],
    groups: &[G, 29, 23, 24, 25],
    sigalgs: &[0x0403, 0x0804, 0x0401, 0x0503, 0x0203, 0x0805, 0x0501, 0x0806, 0x0601, 0x0201],
    alpn: &["h2", "http/1.1"],
    versions: &[G, TLS1_3, TLS1_2, TLS1_1, TLS1_0],
    key_shares: &[G, 29],
    permute: false,
};

const IOS_14: Layout = Layout {
    ciphers: &[
        G, 0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc024, 0xc023,
        0xc00a, 0xc009, 0xc028, 0xc027, 0xc014, 0xc013, 0x009d, 0x009c, 0x003d, 0x003c, 0x0035,
        0x002f,
    ],
    ..SAFARI_16
};

const ANDROID_11_OKHTTP: Layout = Layout {
    ciphers: &[
        0x1301, 0x1302, 0x1303, 0xc02b, 0xc02c, 0xcca9, 0xc02f, 0xc030, 0xcca8, 0xc013, 0xc014,
        0x009c, 0x009d, 0x002f, 0x0035,
    ],
    extensions: &[
        ext::SERVER_NAME,
        ext::EXTENDED_MASTER_SECRET,
        ext::RENEGOTIATION_INFO,
        ext::SUPPORTED_GROUPS,
        ext::EC_POINT_FORMATS,
        ext::SESSION_TICKET,
        ext::SIGNATURE_ALGORITHMS,
        ext::KEY_SHARE,
        ext::PSK_KEY_EXCHANGE_MODES,
        ext::SUPPORTED_VERSIONS,
        ext::ALPN,
    ],
    groups: &[29, 23, 24],
    sigalgs: &[0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601, 0x0201],
    alpn: &["h2", "http/1.1"],
    versions: &[TLS1_3, TLS1_2],
    key_shares: &[29],
    permute: false,
};

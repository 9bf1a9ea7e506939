use crate::resolver::ClientHelloId;

/// Initial HTTP/2 SETTINGS (and connection window) sent by a browser family.
///
/// `None` leaves the value at the HTTP/2 library default, which also means the
/// setting is omitted from the SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Tuning {
    pub header_table_size: Option<u32>,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
}

pub const CHROME: Http2Tuning = Http2Tuning {
    header_table_size: Some(4096),
    enable_push: false,
    max_concurrent_streams: Some(1000),
    initial_window_size: Some(6_291_456),
    max_frame_size: Some(16_384),
    max_header_list_size: Some(262_144),
    initial_connection_window_size: Some(15_728_640),
};

pub const FIREFOX: Http2Tuning = Http2Tuning {
    header_table_size: Some(65_536),
    enable_push: false,
    max_concurrent_streams: None,
    initial_window_size: Some(131_072),
    max_frame_size: Some(16_384),
    max_header_list_size: None,
    initial_connection_window_size: Some(12_582_912),
};

/// Families are matched by identity label prefix.
const FAMILIES: &[(&str, Http2Tuning)] = &[("Chrome", CHROME), ("Firefox", FIREFOX)];

impl Http2Tuning {
    /// Tuning registered for the family of a named identity. Custom identities get none.
    pub fn for_identity(id: &ClientHelloId) -> Option<Http2Tuning> {
        let ClientHelloId::Named(profile) = id else {
            return None;
        };
        FAMILIES
            .iter()
            .find(|(prefix, _)| profile.label().starts_with(prefix))
            .map(|(_, tuning)| *tuning)
    }
}

//! Sub-protocol negotiation.
//!
//! Clients name the protocol generation they speak in the WebSocket
//! sub-protocol header. The accepting side picks the first offer it knows,
//! preferring the current vocabulary when both are offered.

use gqlws_core::{GRAPHQL_SUBSCRIPTIONS, GRAPHQL_WS};
use std::fmt;

/// Protocol generation spoken over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// `graphql-ws`
    #[default]
    Current,
    /// `graphql-subscriptions`
    Legacy,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Current, Protocol::Legacy];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Current => GRAPHQL_WS,
            Protocol::Legacy => GRAPHQL_SUBSCRIPTIONS,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            GRAPHQL_WS => Some(Protocol::Current),
            GRAPHQL_SUBSCRIPTIONS => Some(Protocol::Legacy),
            _ => None,
        }
    }

    pub fn is_legacy(self) -> bool {
        self == Protocol::Legacy
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks a protocol from a `Sec-WebSocket-Protocol` header value.
///
/// The header is a comma separated list; unknown entries are ignored.
pub fn select_protocol(header: &str) -> Option<Protocol> {
    let offered: Vec<Protocol> = header.split(',').filter_map(Protocol::parse).collect();
    if offered.contains(&Protocol::Current) {
        Some(Protocol::Current)
    } else {
        offered.first().copied()
    }
}

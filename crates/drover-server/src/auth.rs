//! Access-token verification for handshakes and HTTP requests.
//!
//! Identity issuance itself is an external concern; the server only needs a
//! token -> identity mapping, loaded from configuration at startup.

use std::collections::HashMap;

use drover_core::ids::IdentityId;

/// WebSocket close code for a missing or invalid access token.
pub const CLOSE_INVALID_TOKEN: u16 = 4001;
/// WebSocket close code for a malformed machine identifier or failed
/// machine registration.
pub const CLOSE_INVALID_MACHINE: u16 = 4002;

/// Static token -> identity table.
pub struct AccessTokens {
    tokens: HashMap<String, IdentityId>,
}

impl AccessTokens {
    pub fn new(pairs: impl IntoIterator<Item = (String, IdentityId)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }

    /// A single-token table, the common single-operator deployment.
    pub fn single(token: impl Into<String>, identity: IdentityId) -> Self {
        Self::new([(token.into(), identity)])
    }

    /// Parse `token=identity` pairs, e.g. from a CLI/env list.
    pub fn parse(entries: &[String]) -> Self {
        Self::new(entries.iter().filter_map(|entry| {
            let (token, identity) = entry.split_once('=')?;
            if token.is_empty() || identity.is_empty() {
                return None;
            }
            Some((token.to_owned(), IdentityId::from_raw(identity)))
        }))
    }

    pub fn verify(&self, token: &str) -> Option<IdentityId> {
        self.tokens.get(token).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

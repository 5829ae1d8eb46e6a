use ethers::types::Address;
use std::collections::HashMap;

use crate::config::CredentialEntry;

/// Maps bearer credentials to ledger identities
#[derive(Debug, Clone, Default)]
pub struct CredentialRegistry {
    tokens: HashMap<String, Address>,
}

impl CredentialRegistry {
    pub fn from_entries(entries: &[CredentialEntry]) -> Self {
        Self {
            tokens: entries
                .iter()
                .map(|entry| (entry.token.clone(), entry.address))
                .collect(),
        }
    }

    pub fn insert(&mut self, token: impl Into<String>, address: Address) {
        self.tokens.insert(token.into(), address);
    }

    pub fn resolve(&self, token: &str) -> Option<Address> {
        self.tokens.get(token).copied()
    }

    /// Whether any credential acts as `address`
    pub fn identifies(&self, address: Address) -> bool {
        self.tokens.values().any(|mapped| *mapped == address)
    }

    /// Resolve an `Authorization` header value (`Bearer <token>` or a bare token)
    pub fn resolve_header(&self, header: &str) -> Option<Address> {
        let token = header
            .strip_prefix("Bearer ")
            .unwrap_or(header)
            .trim();
        self.resolve(token)
    }
}

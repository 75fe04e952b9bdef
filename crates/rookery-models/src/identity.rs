use serde::{Deserialize, Serialize};

/// A user as known to this server: either a local account or a proxy for a
/// user homed on another server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FederatedIdentity {
    pub id: i64,
    pub username: String,
    pub domain: String,
}

impl FederatedIdentity {
    /// `username:domain`
    pub fn handle(&self) -> String {
        format!("{}:{}", self.username, self.domain)
    }

    pub fn is_homed_on(&self, domain: &str) -> bool {
        self.domain.eq_ignore_ascii_case(domain)
    }

    /// Bare username on the identity's home server, full handle everywhere else.
    pub fn display_for(&self, viewing_domain: &str) -> String {
        if self.is_homed_on(viewing_domain) {
            self.username.clone()
        } else {
            self.handle()
        }
    }
}

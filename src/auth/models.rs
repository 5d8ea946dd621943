//! Authentication models used by the push-fabric handshake.
//!
//! User signup/login/CRUD lives in the external REST surface; this crate
//! only ever needs to turn a bearer token into a stable user id.

use serde::{Deserialize, Serialize};

/// JWT claims carried by a push-fabric bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the user id this connection authenticates as.
    pub sub: String,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_reads_subject() {
        let claims = Claims {
            sub: "user-42".to_string(),
            exp: 9_999_999_999,
        };
        assert_eq!(claims.user_id(), "user-42");
    }
}

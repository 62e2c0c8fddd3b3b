use std::fmt;

use serde::Deserialize;

use crate::api;

/// The status of an [`api::Authorization`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// Server's authorization for an account to represent an identifier.
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Authorization {
    pub identifier: api::Identifier,

    pub status: AuthorizationStatus,

    /// RFC 3339 timestamp after which the server considers this authorization invalid.
    pub expires: Option<String>,

    /// For pending authorizations, the challenges the client can fulfill. For valid or invalid
    /// ones, the challenge that was attempted.
    #[serde(default)]
    pub challenges: Vec<api::Challenge>,
}

impl Authorization {
    /// Returns the `http-01` challenge, if one is offered.
    pub fn http_challenge(&self) -> Option<&api::Challenge> {
        self.challenges.iter().find(|c| c._type == api::HTTP_01)
    }

    /// Describes why validation failed, using the first challenge error reported.
    pub fn failure_reason(&self) -> String {
        match self.challenges.iter().find_map(|c| c.error.as_ref()) {
            Some(problem) => problem.to_string(),
            None => "no error reported by the server".to_owned(),
        }
    }
}

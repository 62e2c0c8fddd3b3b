use serde::Deserialize;

use crate::api;

/// Challenge type answered by serving the key authorization over plain HTTP.
pub const HTTP_01: &str = "http-01";

/// The status of an [`api::Challenge`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Server's offer to validate possession of an identifier in a specific way.
///
/// See [RFC 8555 §7.1.5].
///
/// # Example JSON
///
/// ```json
/// {
///   "type": "http-01",
///   "status": "pending",
///   "url": "https://example.com/acme/chall/prV_B7yEyA4",
///   "token": "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0"
/// }
/// ```
///
/// [RFC 8555 §7.1.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,

    /// URL to which a response can be posted.
    pub url: String,

    pub status: ChallengeStatus,

    /// RFC 3339 time at which the server validated this challenge.
    pub validated: Option<String>,

    /// Error that occurred while the server was validating the challenge, if any.
    pub error: Option<api::Problem>,

    #[serde(default)]
    pub token: String,
}

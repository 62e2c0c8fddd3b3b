//! JSON payloads exchanged with the ACME server.
//!
//! Field names follow [RFC 8555 §7.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1).

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

mod account;
mod authorization;
mod challenge;
mod directory;
mod finalize;
mod identifier;
mod order;

pub use self::{
    account::{Account, NewAccount},
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeStatus, HTTP_01},
    directory::{Directory, DirectoryMeta},
    finalize::Finalize,
    identifier::Identifier,
    order::{NewOrder, Order, OrderStatus},
};

/// Serializes to `{}`.
///
/// Posted to a challenge URL to tell the server the response is in place.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Problem document as described by [RFC 7807] and used by [RFC 8555 §6.7].
///
/// [RFC 7807]: https://datatracker.ietf.org/doc/html/rfc7807
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    /// Builds a problem for a response that did not carry a problem document.
    pub(crate) fn synthetic(_type: &str, detail: String) -> Self {
        Problem {
            _type: _type.to_owned(),
            detail: Some(detail),
            subproblems: None,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type)?,
            None => write!(f, "{}", self._type)?,
        }

        for sub in self.subproblems.iter().flatten() {
            write!(f, "; {sub}")?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type", default)]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl fmt::Display for Subproblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(identifier) = &self.identifier {
            write!(f, "[{}] ", identifier.value)?;
        }

        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            None => write!(f, "{}", self._type),
        }
    }
}

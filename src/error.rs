use std::sync::Arc;

use crate::api::Problem;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while reconciling TLS entries against an ACME provider.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid issuer setup. Fatal during startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The ACME server answered with something we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The ACME server answered with a problem document.
    #[error("ACME server reported a problem: {0}")]
    AcmeProblem(Problem),

    /// Account was created but the server does not consider it valid.
    #[error("account for issuer {issuer} is not valid, was {status}")]
    Account { issuer: String, status: String },

    /// Another caller's account creation failed while we were waiting on it.
    #[error("account creation failed: {0}")]
    AccountCreation(Arc<Error>),

    /// The authorization ended in a status other than `valid`.
    #[error("authorization for {identifier} ended as {status}: {reason}")]
    AuthorizationFailed {
        identifier: String,
        status: String,
        reason: String,
    },

    /// The authorization did not offer an `http-01` challenge.
    #[error("no http-01 challenge offered for {0}")]
    UnsupportedChallenge(String),

    /// The order was not `valid` after submitting the CSR.
    #[error("order {order} is not valid after finalize, was {status}")]
    Finalize { order: String, status: String },

    /// A resource stayed `pending` or `processing` for every allowed poll.
    #[error("{what} still pending after {attempts} attempts")]
    PollExhausted { what: String, attempts: u32 },

    /// The CA never fetched the challenge response within the allowed time.
    #[error("challenge for token {0} was not probed in time")]
    ChallengeProbeTimeout(String),

    /// Temporary solver route could not be set up.
    #[error("solver error: {0}")]
    Solver(String),

    /// Key generation, signing or certificate encoding failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn solver(msg: impl Into<String>) -> Self {
        Self::Solver(msg.into())
    }

    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Returns the ACME problem carried by this error, looking through shared failures.
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Error::AcmeProblem(problem) => Some(problem),
            Error::AccountCreation(inner) => inner.problem(),
            _ => None,
        }
    }
}

impl From<Problem> for Error {
    fn from(problem: Problem) -> Self {
        Error::AcmeProblem(problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_is_visible_through_shared_failure() {
        let problem = Problem {
            _type: "urn:ietf:params:acme:error:rateLimited".to_owned(),
            detail: Some("too many new accounts".to_owned()),
            subproblems: None,
        };

        let err = Error::AccountCreation(Arc::new(Error::from(problem.clone())));
        assert_eq!(err.problem(), Some(&problem));
        assert!(err.to_string().contains("too many new accounts"));
    }

    #[test]
    fn configuration_error_message() {
        let err = Error::configuration("issuer staging has no directory");
        assert_eq!(
            err.to_string(),
            "configuration error: issuer staging has no directory"
        );
    }
}

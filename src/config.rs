//! Controller settings.
//!
//! Loaded from an optional file and then overridden by `KITA__*` environment variables, e.g.
//! `KITA__DRY_RUN=true` or `KITA__ISSUERS__STAGING__DIRECTORY_URL=...`.

use std::{collections::HashMap, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "KITA";

/// One ACME provider, such as Let's Encrypt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuerSettings {
    pub directory_url: String,

    /// Plain addresses; the `mailto:` scheme is added when registering.
    pub emails: Vec<String>,

    #[serde(default)]
    pub terms_of_service_agreed: bool,
}

/// Polling of authorizations and orders, see
/// [RFC 8555 §7.5.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.5.1).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthFinalize {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
}

impl Default for AuthFinalize {
    fn default() -> Self {
        AuthFinalize {
            max_attempts: default_max_attempts(),
            poll_delay_ms: default_poll_delay_ms(),
        }
    }
}

impl AuthFinalize {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub issuers: HashMap<String, IssuerSettings>,

    /// Allowed response time when talking to an ACME server.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// Interval of the full sweep over all managed Ingresses.
    #[serde(default = "default_renewal_check_interval_secs")]
    pub renewal_check_interval_secs: u64,

    #[serde(default)]
    pub auth_finalize: AuthFinalize,

    /// How long the CA gets to fetch the challenge response once asked to validate.
    #[serde(default = "default_challenge_probe_timeout_secs")]
    pub challenge_probe_timeout_secs: u64,

    /// How long a solver Ingress may take to get a load-balancer address.
    #[serde(default = "default_solver_ready_timeout_secs")]
    pub solver_ready_timeout_secs: u64,

    /// Detect missing or expiring TLS secrets but never talk to the ACME server.
    #[serde(default)]
    pub dry_run: bool,

    /// Value of the role label identifying the Service that answers challenges.
    #[serde(default = "default_solver_role")]
    pub solver_role: String,

    /// Issuer used for every Ingress regardless of its issuer label.
    #[serde(default)]
    pub override_issuer: Option<String>,

    /// Address the challenge responder listens on.
    #[serde(default = "default_responder_bind")]
    pub responder_bind: String,

    /// Namespace to operate in; the client's default namespace when unset.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_max_attempts() -> u32 {
    60
}

fn default_poll_delay_ms() -> u64 {
    2_000
}

fn default_response_timeout_secs() -> u64 {
    10
}

fn default_renewal_check_interval_secs() -> u64 {
    3_600
}

fn default_challenge_probe_timeout_secs() -> u64 {
    120
}

fn default_solver_ready_timeout_secs() -> u64 {
    300
}

fn default_solver_role() -> String {
    "solver".to_owned()
}

fn default_responder_bind() -> String {
    "0.0.0.0:8080".to_owned()
}

impl Settings {
    /// Reads settings from `path` (if given) and the environment, then validates them.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize::<Settings>())
            .map_err(|err| Error::configuration(err.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.issuers.is_empty() {
            return Err(Error::configuration("at least one issuer is required"));
        }

        for (id, issuer) in &self.issuers {
            if issuer.directory_url.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "issuer {id} has no directory_url"
                )));
            }

            if issuer.emails.is_empty() || issuer.emails.iter().any(|e| e.trim().is_empty()) {
                return Err(Error::configuration(format!(
                    "issuer {id} needs at least one non-blank email"
                )));
            }

            if !issuer.terms_of_service_agreed {
                return Err(Error::configuration(format!(
                    "issuer {id} must agree to the terms of service"
                )));
            }
        }

        if self.auth_finalize.max_attempts == 0 {
            return Err(Error::configuration(
                "auth_finalize.max_attempts must be at least 1",
            ));
        }

        if self.solver_role.trim().is_empty() {
            return Err(Error::configuration("solver_role must not be blank"));
        }

        if let Some(id) = &self.override_issuer {
            if !self.issuers.contains_key(id) {
                return Err(Error::configuration(format!(
                    "override_issuer {id} is not a configured issuer"
                )));
            }
        }

        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_interval_secs)
    }

    pub fn challenge_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_probe_timeout_secs)
    }

    pub fn solver_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.solver_ready_timeout_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_settings(directory_url: &str) -> Settings {
    Settings {
        issuers: HashMap::from([(
            "staging".to_owned(),
            IssuerSettings {
                directory_url: directory_url.to_owned(),
                emails: vec!["foo@bar.com".to_owned()],
                terms_of_service_agreed: true,
            },
        )]),
        response_timeout_secs: 10,
        renewal_check_interval_secs: 3_600,
        auth_finalize: AuthFinalize {
            max_attempts: 3,
            poll_delay_ms: 1,
        },
        challenge_probe_timeout_secs: 5,
        solver_ready_timeout_secs: 5,
        dry_run: false,
        solver_role: default_solver_role(),
        override_issuer: None,
        responder_bind: default_responder_bind(),
        namespace: None,
    }
}

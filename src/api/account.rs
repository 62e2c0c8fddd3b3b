use serde::{Deserialize, Serialize};

/// Payload posted to the `newAccount` resource.
///
/// See [RFC 8555 §7.3].
///
/// [RFC 8555 §7.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub contact: Vec<String>,

    pub terms_of_service_agreed: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub only_return_existing: bool,
}

impl NewAccount {
    /// Builds the request from plain email addresses, adding the `mailto:` scheme.
    pub fn from_emails<S: AsRef<str>>(emails: &[S], terms_of_service_agreed: bool) -> Self {
        NewAccount {
            contact: emails
                .iter()
                .map(|email| format!("mailto:{}", email.as_ref()))
                .collect(),
            terms_of_service_agreed,
            only_return_existing: false,
        }
    }
}

/// An ACME account resource as returned by the server.
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "valid",
///   "contact": ["mailto:cert-admin@example.com"],
///   "orders": "https://example.com/acme/acct/evOfKhNU60wg/orders"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// One of `valid`, `deactivated` or `revoked`.
    pub status: Option<String>,

    pub contact: Option<Vec<String>>,

    pub orders: Option<String>,
}

impl Account {
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }

    pub fn status(&self) -> &str {
        self.status.as_deref().unwrap_or("unknown")
    }
}

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Order`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Payload posted to the `newOrder` resource.
///
/// See [RFC 8555 §7.4].
///
/// [RFC 8555 §7.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub identifiers: Vec<api::Identifier>,
}

impl NewOrder {
    /// DNS identifiers for `hosts`, dropping duplicates while keeping the first host first.
    pub fn for_hosts<S: AsRef<str>>(hosts: &[S]) -> Self {
        let mut seen = HashSet::new();
        let identifiers = hosts
            .iter()
            .map(AsRef::as_ref)
            .filter(|host| seen.insert(*host))
            .map(api::Identifier::dns)
            .collect();

        NewOrder { identifiers }
    }
}

/// An ACME order object.
///
/// Tracks a request for a certificate through to issuance.
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "pending",
///   "expires": "2019-01-09T08:26:43.570360537Z",
///   "identifiers": [{ "type": "dns", "value": "a.example.com" }],
///   "authorizations": ["https://example.com/acme/authz/PAniVnsZcis"],
///   "finalize": "https://example.com/acme/order/TOlocE8rfgo/finalize"
/// }
/// ```
///
/// See [RFC 8555 §7.1.3].
///
/// [RFC 8555 §7.1.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: OrderStatus,

    pub expires: Option<String>,

    #[serde(default)]
    pub identifiers: Vec<api::Identifier>,

    pub error: Option<api::Problem>,

    #[serde(default)]
    pub authorizations: Vec<String>,

    pub finalize: String,

    /// Present once the order is `valid`.
    pub certificate: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_order_dedups_hosts() {
        let order = NewOrder::for_hosts(&["a.example.com", "b.example.com", "a.example.com"]);
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "identifiers": [
                    { "type": "dns", "value": "a.example.com" },
                    { "type": "dns", "value": "b.example.com" }
                ]
            })
        );
    }

    #[test]
    fn valid_order_with_certificate() {
        let order: Order = serde_json::from_str(
            r#"{
                "status": "valid",
                "identifiers": [{ "type": "dns", "value": "a.example.com" }],
                "authorizations": ["https://x/authz/1"],
                "finalize": "https://x/finalize/1",
                "certificate": "https://x/cert/1"
            }"#,
        )
        .unwrap();

        assert_eq!(order.status, OrderStatus::Valid);
        assert_eq!(order.certificate.as_deref(), Some("https://x/cert/1"));
    }
}

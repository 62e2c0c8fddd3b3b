use serde::Serialize;

/// Request that finalizes an order with a CSR.
///
/// See [RFC 8555 §7.4].
///
/// [RFC 8555 §7.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finalize {
    /// CSR in base64url-encoded DER, not PEM.
    pub csr: String,
}

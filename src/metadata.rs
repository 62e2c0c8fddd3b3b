//! Label and annotation names shared by every resource the controller reads or writes.

/// On Ingresses: which issuer to request certificates from. On Secrets: which issuer produced the
/// certificate.
pub const ISSUER_LABEL: &str = "acme.itzg.github.io/issuer";

/// Marks the Service answering challenges and the temporary solver Ingresses.
pub const ROLE_LABEL: &str = "acme.itzg.github.io/role";

/// On Secrets: the Ingress the certificate was issued for.
pub const FOR_INGRESS_LABEL: &str = "acme.itzg.github.io/for-ingress";

/// On solver Ingresses: the host being validated. On Secrets: the comma-separated host list.
pub const HOST_ANNOTATION: &str = "acme.itzg.github.io/host";

/// Port name picked on the solver Service when it has more than one port.
pub const SOLVER_SERVICE_PORT_NAME: &str = "http";

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Selects Ingresses requesting certificates, excluding our own solver Ingresses.
pub fn managed_ingress_selector(solver_role: &str) -> String {
    format!("{ISSUER_LABEL},{ROLE_LABEL} notin ({solver_role})")
}

/// Selects TLS Secrets written by the controller.
pub fn managed_secret_selector() -> String {
    ISSUER_LABEL.to_owned()
}

/// Selects the Service answering challenges.
pub fn solver_service_selector(solver_role: &str) -> String {
    format!("{ROLE_LABEL}={solver_role}")
}

//! Caller-facing error surface. Internal transport plumbing (XML parsing, HTTP,
//! SOAP marshaling) stays on `anyhow::Result`; everything that crosses back out
//! to a mapping caller is funneled through [MappingError].

/// Which side of the install pipeline an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// The engine's own reasoning, not the router: an unparseable or empty
    /// external IP address.
    ExternalAddress,
    /// A SOAP action the router itself rejected or failed to answer.
    Transport,
}

impl std::fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDomain::ExternalAddress => write!(f, "external address"),
            ErrorDomain::Transport => write!(f, "transport"),
        }
    }
}

/// The error reported alongside `error-mapping-port`. Cancellation is
/// deliberately not representable here: a cancelled install is not an error.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// The endpoint's address tracker could not obtain a usable external IP
    /// (unparseable or empty reply from `GetExternalIPAddress`).
    #[error("failed to resolve external address: {message}")]
    ExternalAddress { message: String },
    /// `AddPortMapping`/renewal failed against the router, including a 718
    /// conflict when the caller pinned a specific external port.
    #[error("{domain} error {code}: {message}")]
    Transport {
        domain: ErrorDomain,
        code: u16,
        message: String,
    },
}

impl MappingError {
    pub fn external_address(message: impl Into<String>) -> Self {
        Self::ExternalAddress {
            message: message.into(),
        }
    }

    pub fn transport(domain: ErrorDomain, code: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            domain,
            code,
            message: message.into(),
        }
    }
}

impl From<crate::transport::service_client::ActionCallError> for MappingError {
    fn from(err: crate::transport::service_client::ActionCallError) -> Self {
        match err {
            crate::transport::service_client::ActionCallError::Action(action_err) => {
                Self::transport(
                    ErrorDomain::Transport,
                    action_err.code.code(),
                    action_err.to_string(),
                )
            }
            other => Self::transport(ErrorDomain::Transport, 0, other.to_string()),
        }
    }
}

//! Runtime error classification.
//!
//! Maps runtime CLI stderr to an error class by signature, so retry policy
//! can be unit-tested without ever executing a container runtime. The
//! signature table is the single source of truth; adding a newly observed
//! failure mode means adding a line here and a test case below.

/// Classes of runtime failure with distinct handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Daemon unreachable. Fatal.
    Unavailable,
    /// Named resource does not exist. Success for removal paths.
    NotFound,
    /// Connectivity failure during pull. Retried with force-recreate.
    Network,
    /// Intermittent platform failure. Retried once.
    Transient,
    /// Anything unrecognized. Propagated as-is.
    Other,
}

const UNAVAILABLE_SIGNATURES: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "docker daemon is not running",
    "error during connect",
    "the docker client must be run with elevated privileges",
];

const NOT_FOUND_SIGNATURES: &[&str] = &[
    "no such container",
    "no such volume",
    "no such network",
    "no such image",
    "no such object",
    "not found: volume",
];

const NETWORK_SIGNATURES: &[&str] = &[
    "failed to resolve reference",
    "no such host",
    "temporary failure in name resolution",
    "tls handshake timeout",
    "timeout exceeded while awaiting headers",
    "network is unreachable",
    "connection reset by peer",
    "could not resolve host",
];

const TRANSIENT_SIGNATURES: &[&str] = &[
    "failed to create shim task",
    "oci runtime create failed",
    "device or resource busy",
    "error while creating mount source path",
    "driver failed programming external connectivity",
    "container is marked for removal and cannot be started",
    "grpc: the connection is unavailable",
];

/// Classify runtime CLI output. Matching is case-insensitive; the first
/// class with a matching signature wins, in the order unavailable,
/// not-found, network, transient.
pub fn classify_runtime_output(output: &str) -> RuntimeErrorKind {
    let lower = output.to_lowercase();

    let tables: [(&[&str], RuntimeErrorKind); 4] = [
        (UNAVAILABLE_SIGNATURES, RuntimeErrorKind::Unavailable),
        (NOT_FOUND_SIGNATURES, RuntimeErrorKind::NotFound),
        (NETWORK_SIGNATURES, RuntimeErrorKind::Network),
        (TRANSIENT_SIGNATURES, RuntimeErrorKind::Transient),
    ];

    for (signatures, kind) in tables {
        if signatures.iter().any(|sig| lower.contains(sig)) {
            return kind;
        }
    }
    RuntimeErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_unreachable() {
        assert_eq!(
            classify_runtime_output(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. \
                 Is the docker daemon running?"
            ),
            RuntimeErrorKind::Unavailable
        );
        assert_eq!(
            classify_runtime_output(
                "error during connect: Get \"http://localhost:2375/v1.24/info\""
            ),
            RuntimeErrorKind::Unavailable
        );
    }

    #[test]
    fn test_not_found() {
        assert_eq!(
            classify_runtime_output("Error response from daemon: No such container: shop-api-1"),
            RuntimeErrorKind::NotFound
        );
        assert_eq!(
            classify_runtime_output("Error response from daemon: get deps: no such volume"),
            RuntimeErrorKind::NotFound
        );
        assert_eq!(
            classify_runtime_output("Error: No such network: shop_default"),
            RuntimeErrorKind::NotFound
        );
    }

    #[test]
    fn test_network_failures() {
        assert_eq!(
            classify_runtime_output(
                "failed to resolve reference \"docker.io/library/node:20\": \
                 dial tcp: lookup registry-1.docker.io: no such host"
            ),
            RuntimeErrorKind::Network
        );
        assert_eq!(
            classify_runtime_output(
                "net/http: request canceled while waiting for connection \
                 (Client.Timeout exceeded while awaiting headers)"
            ),
            RuntimeErrorKind::Network
        );
        assert_eq!(
            classify_runtime_output("Get https://registry-1.docker.io/v2/: TLS handshake timeout"),
            RuntimeErrorKind::Network
        );
    }

    #[test]
    fn test_transient_failures() {
        assert_eq!(
            classify_runtime_output(
                "Error response from daemon: failed to create shim task: \
                 OCI runtime create failed: runc create failed"
            ),
            RuntimeErrorKind::Transient
        );
        assert_eq!(
            classify_runtime_output(
                "Error response from daemon: driver failed programming external \
                 connectivity on endpoint shop-api-1"
            ),
            RuntimeErrorKind::Transient
        );
        assert_eq!(
            classify_runtime_output("error while creating mount source path '/host/src'"),
            RuntimeErrorKind::Transient
        );
    }

    #[test]
    fn test_unrecognized_is_other() {
        assert_eq!(
            classify_runtime_output("Error response from daemon: conflict: unable to remove"),
            RuntimeErrorKind::Other
        );
        assert_eq!(classify_runtime_output(""), RuntimeErrorKind::Other);
    }

    #[test]
    fn test_unavailable_wins_over_network() {
        // "error during connect" also mentions a connection failure; the
        // daemon class takes precedence.
        assert_eq!(
            classify_runtime_output(
                "error during connect: dial tcp 127.0.0.1:2375: connection reset by peer"
            ),
            RuntimeErrorKind::Unavailable
        );
    }
}

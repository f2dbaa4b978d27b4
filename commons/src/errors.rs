use std::fmt;

/// Classified mirroring error, surfaced to the user with remediation hints.
///
/// Every network-facing operation in the workspace normalizes its transport
/// errors into one of these categories. The category decides both the retry
/// policy and the final human-readable report.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MirrorError {
    /// TLS handshake or certificate-chain validation failure.
    #[error("TLS certificate verification failed: {0}")]
    CertificateUntrusted(String),

    /// Registry returned 401/403 or an unauthorized/denied error code.
    #[error("registry authentication failed: {0}")]
    Unauthorized(String),

    /// DNS failure, connection refused/reset, unreachable host.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// `MANIFEST_UNKNOWN` or plain 404 on an artifact.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// `NAME_UNKNOWN`: the repository itself does not exist.
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// Registry rejected a custom media type (`MANIFEST_INVALID`).
    #[error("registry rejected media type: {0}")]
    UnsupportedMediaType(String),

    /// Anything unclassified.
    #[error("{0}")]
    Fatal(String),
}

impl MirrorError {
    /// Return the short kind for the error.
    pub fn as_kind(&self) -> &'static str {
        match self {
            MirrorError::CertificateUntrusted(_) => "tls",
            MirrorError::Unauthorized(_) => "auth",
            MirrorError::NetworkUnavailable(_) => "network",
            MirrorError::ImageNotFound(_) => "not-found",
            MirrorError::RepoNotFound(_) => "repo-not-found",
            MirrorError::UnsupportedMediaType(_) => "unsupported-media-type",
            MirrorError::Fatal(_) => "fatal",
        }
    }

    /// Return the value for the error.
    pub fn as_value(&self) -> String {
        format!("{}", self)
    }

    /// Whether the retry runner may attempt the operation again.
    ///
    /// Auth and TLS failures will not heal by waiting; an unsupported media
    /// type needs destination-registry configuration, not patience.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::NetworkUnavailable(_)
                | MirrorError::ImageNotFound(_)
                | MirrorError::Fatal(_)
        )
    }

    /// Likely causes and remediation bullets, per category.
    fn advice(&self) -> &'static [&'static str] {
        match self {
            MirrorError::CertificateUntrusted(_) => &[
                "the registry serves a certificate signed by an unknown authority",
                "add the CA to the system trust store, or pass --tls-skip-verify",
            ],
            MirrorError::Unauthorized(_) => &[
                "the supplied license token or login/password was rejected",
                "check --license / --source-login / --registry-login values and account permissions",
            ],
            MirrorError::NetworkUnavailable(_) => &[
                "DNS resolution or TCP connection to the registry failed",
                "check connectivity, proxies and firewall rules, then re-run; transfers resume",
            ],
            MirrorError::ImageNotFound(_) => &[
                "the requested tag does not exist on the registry",
                "verify the requested version or tag actually exists for your edition",
            ],
            MirrorError::RepoNotFound(_) => &[
                "the repository path does not exist on the registry",
                "verify the registry path given via --source or --registry",
            ],
            MirrorError::UnsupportedMediaType(_) => &[
                "the destination registry rejects non-standard OCI media types",
                "allow foreign/custom media types in the destination registry configuration",
            ],
            MirrorError::Fatal(_) => &["an unrecoverable error occurred; see the message above"],
        }
    }
}

/// Render the final multi-section report for a top-level failure.
///
/// Walks the anyhow chain looking for a classified [`MirrorError`]; falls
/// back to the `fatal` category when nothing classified is found.
pub fn format_error_report(err: &anyhow::Error) -> String {
    let classified = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<MirrorError>());

    let kind = classified.map(MirrorError::as_kind).unwrap_or("fatal");
    let advice: Vec<&str> = classified
        .map(|e| e.advice().to_vec())
        .unwrap_or_else(|| vec!["an unrecoverable error occurred; see the message above"]);

    let mut out = String::new();
    fmt::Write::write_fmt(&mut out, format_args!("Error ({}): {:#}\n", kind, err))
        .expect("writing to a String cannot fail");
    for line in advice {
        out.push_str("  * ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

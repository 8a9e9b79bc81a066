use anyhow::anyhow;

/// Stable failure classes for the update engine. Every error that crosses the
/// operator boundary carries one of these tokens as a message prefix so the
/// CLI can map it to an exit code without scraping free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Locked,
    BadRepositoryState,
    NotFound,
    NetworkError,
    PermissionError,
    CheckoutVerificationFailed,
    ServiceStopFailed,
    ServiceStartFailed,
    ArtifactValidationFailed,
    ProcessReplacementFailed,
    Interrupted,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::BadRepositoryState => "bad-repo-state",
            Self::NotFound => "not-found",
            Self::NetworkError => "network-error",
            Self::PermissionError => "permission-error",
            Self::CheckoutVerificationFailed => "checkout-verification-failed",
            Self::ServiceStopFailed => "service-stop-failed",
            Self::ServiceStartFailed => "service-start-failed",
            Self::ArtifactValidationFailed => "artifact-validation-failed",
            Self::ProcessReplacementFailed => "process-replacement-failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "locked" => Some(Self::Locked),
            "bad-repo-state" => Some(Self::BadRepositoryState),
            "not-found" => Some(Self::NotFound),
            "network-error" => Some(Self::NetworkError),
            "permission-error" => Some(Self::PermissionError),
            "checkout-verification-failed" => Some(Self::CheckoutVerificationFailed),
            "service-stop-failed" => Some(Self::ServiceStopFailed),
            "service-start-failed" => Some(Self::ServiceStartFailed),
            "artifact-validation-failed" => Some(Self::ArtifactValidationFailed),
            "process-replacement-failed" => Some(Self::ProcessReplacementFailed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Locked => 11,
            Self::BadRepositoryState => 12,
            Self::NotFound => 13,
            Self::NetworkError => 14,
            Self::PermissionError => 15,
            Self::CheckoutVerificationFailed => 16,
            Self::ServiceStopFailed => 17,
            Self::ServiceStartFailed => 18,
            Self::ArtifactValidationFailed => 19,
            Self::ProcessReplacementFailed => 20,
            Self::Interrupted => 21,
        }
    }
}

/// Build a coded error: `<code>: <message>`.
pub fn failure(code: FailureCode, message: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("{}: {}", code.as_str(), message)
}

/// Recover the failure code from an error chain, if any link carries one.
pub fn failure_code(error: &anyhow::Error) -> Option<FailureCode> {
    for cause in error.chain() {
        let text = cause.to_string();
        if let Some((prefix, _)) = text.split_once(": ") {
            if let Some(code) = FailureCode::parse(prefix) {
                return Some(code);
            }
        }
    }
    None
}

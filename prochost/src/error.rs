use thiserror::Error;

/// The setup phase a launch failure occurred in. Carried by [`Error::Launch`]
/// so callers can tell a resource-acquisition failure from a failed
/// `CreateProcess` call without parsing message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    /// Allocating the job object, completion port, or pipes.
    AcquireResources,
    /// Resolving the target session and obtaining a usable primary token.
    ResolveIdentity,
    /// Building the environment block for the target user.
    BuildEnvironment,
    /// The process-creation call itself (direct or shell-invoked).
    CreateProcess,
    /// Assigning the new process to the job object and resuming it.
    StartSupervision,
    /// The post-launch wait loop or an output reader.
    Monitor,
}

impl std::fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LaunchPhase::AcquireResources => "resource acquisition",
            LaunchPhase::ResolveIdentity => "identity resolution",
            LaunchPhase::BuildEnvironment => "environment setup",
            LaunchPhase::CreateProcess => "process creation",
            LaunchPhase::StartSupervision => "supervision start",
            LaunchPhase::Monitor => "process monitoring",
        };
        f.write_str(name)
    }
}

/// Everything that can go wrong while building a descriptor or launching a
/// process.
///
/// Timeout is deliberately absent: a timeout kill is a documented terminal
/// state delivered through [`crate::ExecutionResult`] with the reserved
/// [`crate::TIMEOUT_EXIT_CODE`], not an error.
///
/// The type is `Clone` because a resolved launch result is handed out to
/// every caller of [`crate::ProcessHandle::wait`], however many times it is
/// called.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The descriptor was rejected at construction time. Never retried.
    #[error("invalid launch descriptor: {0}")]
    Validation(String),

    /// The caller lacks a privilege required for a cross-identity launch, or
    /// a requested elevated token was not actually elevated.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// An OS call failed during setup. Carries the native error code; the
    /// caller decides whether to retry the launch.
    #[error("{phase} failed (os error {code:#010x}): {message}")]
    Launch {
        phase: LaunchPhase,
        /// The HRESULT from the failing call.
        code: i32,
        message: String,
    },

    /// An impossible state was observed (an unexpected wait result, a
    /// contract violation by a collaborator). Always a logic defect, never
    /// swallowed or retried.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub(crate) fn authorization(message: impl Into<String>) -> Self {
        Error::Authorization(message.into())
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant(message.into())
    }

    /// True when the failure is a setup-time OS error rather than a rejected
    /// descriptor or a logic defect.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Error::Launch { .. })
    }
}

#[cfg(windows)]
impl Error {
    pub(crate) fn launch(phase: LaunchPhase, source: windows::core::Error) -> Self {
        Error::Launch {
            phase,
            code: source.code().0,
            message: source.message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_names_the_phase() {
        let err = Error::Launch {
            phase: LaunchPhase::CreateProcess,
            code: -2147024894,
            message: "The system cannot find the file specified.".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("process creation"), "{text}");
        assert!(text.contains("0x80070002"), "{text}");
    }

    #[test]
    fn taxonomy_is_distinguishable() {
        assert!(!Error::validation("x").is_launch_failure());
        assert!(!Error::authorization("x").is_launch_failure());
        assert!(!Error::invariant("x").is_launch_failure());
    }
}

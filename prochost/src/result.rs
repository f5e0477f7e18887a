//! The terminal outcome of a supervised launch.

/// Exit code reserved for processes killed because the cancellation signal
/// fired before they exited. Distinguishable from any legitimate exit code
/// the toolkit's deployments produce.
pub const TIMEOUT_EXIT_CODE: i32 = -443991205;

/// The immutable outcome of one launch, delivered exactly once through
/// [`crate::ProcessHandle::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    process_id: u32,
    exit_code: Option<i32>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    interleaved: Vec<String>,
}

impl ExecutionResult {
    pub(crate) fn new(
        process_id: u32,
        exit_code: Option<i32>,
        stdout: Vec<String>,
        stderr: Vec<String>,
        interleaved: Vec<String>,
    ) -> Self {
        Self {
            process_id,
            exit_code,
            stdout: trim_blank_edges(stdout),
            stderr: trim_blank_edges(stderr),
            interleaved: trim_blank_edges(interleaved),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// The process exit code. `None` only when the wait was abandoned with
    /// termination-on-timeout disabled, leaving the process running.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// True when the process was killed by the timeout path.
    pub fn timed_out(&self) -> bool {
        self.exit_code == Some(TIMEOUT_EXIT_CODE)
    }

    /// Decoded stdout lines, in order, with leading/trailing blank lines
    /// removed.
    pub fn stdout(&self) -> &[String] {
        &self.stdout
    }

    /// Decoded stderr lines, in order, with leading/trailing blank lines
    /// removed.
    pub fn stderr(&self) -> &[String] {
        &self.stderr
    }

    /// Chronological merge of stdout and stderr.
    pub fn interleaved(&self) -> &[String] {
        &self.interleaved
    }
}

/// Removes leading and trailing blank lines; interior blanks are part of the
/// output and stay.
fn trim_blank_edges(mut lines: Vec<String>) -> Vec<String> {
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    let leading = lines
        .iter()
        .take_while(|line| line.is_empty())
        .count();
    if leading > 0 {
        lines.drain(..leading);
    }
    lines
}

//! The launch descriptor: an immutable, validated description of what to
//! run, how, and under whose identity. Building one performs no OS calls
//! beyond resolving a relative program name against PATH.

use std::path::{Path, PathBuf};

use crate::cmdline;
use crate::error::{Error, Result};

#[cfg(windows)]
use crate::cancel::CancellationEvent;

/// How the process should be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Always create the process directly (`CreateProcessW` family).
    #[default]
    Direct,
    /// Always go through the shell (`ShellExecuteExW`), preserving verbs and
    /// UAC behavior. Incompatible with output redirection and with targeting
    /// another user.
    Shell,
    /// Let the launcher pick: windowed applications go through the shell for
    /// double-click-equivalent behavior, everything else is created directly.
    Auto,
}

/// Initial window state for the new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowStyle {
    #[default]
    Normal,
    Hidden,
    Minimized,
    Maximized,
}

/// Priority class assigned to the new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPriority {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    Realtime,
}

/// Text encoding used to decode redirected output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamEncoding {
    #[default]
    Utf8,
    Utf16Le,
}

/// An immutable description of a process launch. Built once via
/// [`LaunchDescriptorBuilder`], validated at construction, never mutated.
#[derive(Debug, Clone)]
pub struct LaunchDescriptor {
    program: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    target_user: Option<String>,
    use_linked_elevated_token: bool,
    inherit_environment: bool,
    mode: ExecutionMode,
    verb: Option<String>,
    hide_window: bool,
    window_style: Option<WindowStyle>,
    priority: Option<ProcessPriority>,
    redirect_output: bool,
    merge_streams: bool,
    encoding: StreamEncoding,
    terminate_on_timeout: bool,
    wait_for_children: bool,
    kill_tree_on_close: bool,
    command_line: String,
    #[cfg(windows)]
    cancellation: Option<CancellationEvent>,
}

impl LaunchDescriptor {
    /// Starts building a descriptor for the given program. Relative names
    /// are resolved against PATH during [`LaunchDescriptorBuilder::build`].
    pub fn builder(program: impl Into<PathBuf>) -> LaunchDescriptorBuilder {
        LaunchDescriptorBuilder::new(program)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The working directory for the new process. Defaults to the program's
    /// own directory when not set explicitly.
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn target_user(&self) -> Option<&str> {
        self.target_user.as_deref()
    }

    pub fn use_linked_elevated_token(&self) -> bool {
        self.use_linked_elevated_token
    }

    pub fn inherit_environment(&self) -> bool {
        self.inherit_environment
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    pub fn hide_window(&self) -> bool {
        self.hide_window
    }

    pub fn window_style(&self) -> Option<WindowStyle> {
        self.window_style
    }

    pub fn priority(&self) -> Option<ProcessPriority> {
        self.priority
    }

    pub fn redirect_output(&self) -> bool {
        self.redirect_output
    }

    pub fn merge_streams(&self) -> bool {
        self.merge_streams
    }

    pub fn encoding(&self) -> StreamEncoding {
        self.encoding
    }

    pub fn terminate_on_timeout(&self) -> bool {
        self.terminate_on_timeout
    }

    pub fn wait_for_children(&self) -> bool {
        self.wait_for_children
    }

    pub fn kill_tree_on_close(&self) -> bool {
        self.kill_tree_on_close
    }

    /// The fully composed command line: quoted program path plus quoted
    /// arguments.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    #[cfg(windows)]
    pub fn cancellation(&self) -> Option<&CancellationEvent> {
        self.cancellation.as_ref()
    }
}

/// Builder for [`LaunchDescriptor`]. All setters are infallible; every
/// validation rule is applied in [`build`](Self::build).
#[derive(Debug)]
pub struct LaunchDescriptorBuilder {
    program: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    target_user: Option<String>,
    use_linked_elevated_token: bool,
    inherit_environment: bool,
    mode: ExecutionMode,
    verb: Option<String>,
    hide_window: bool,
    window_style: Option<WindowStyle>,
    priority: Option<ProcessPriority>,
    redirect_output: bool,
    merge_streams: bool,
    encoding: StreamEncoding,
    terminate_on_timeout: bool,
    wait_for_children: bool,
    kill_tree_on_close: bool,
    #[cfg(windows)]
    cancellation: Option<CancellationEvent>,
}

impl LaunchDescriptorBuilder {
    fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            target_user: None,
            use_linked_elevated_token: false,
            inherit_environment: false,
            mode: ExecutionMode::default(),
            verb: None,
            hide_window: false,
            window_style: None,
            priority: None,
            redirect_output: false,
            merge_streams: false,
            encoding: StreamEncoding::default(),
            terminate_on_timeout: true,
            wait_for_children: false,
            kill_tree_on_close: false,
            #[cfg(windows)]
            cancellation: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Launch as this user, who must have an active interactive session.
    /// Accepts `user` or `DOMAIN\user`.
    pub fn target_user(mut self, user: impl Into<String>) -> Self {
        self.target_user = Some(user.into());
        self
    }

    /// Use the target user's linked elevated token under split-token
    /// elevation. Requires [`target_user`](Self::target_user).
    pub fn use_linked_elevated_token(mut self, yes: bool) -> Self {
        self.use_linked_elevated_token = yes;
        self
    }

    /// Let the target inherit the caller's environment variables instead of
    /// starting from the target user's own profile environment.
    pub fn inherit_environment(mut self, yes: bool) -> Self {
        self.inherit_environment = yes;
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shell verb such as `open` or `runas`. Only meaningful for
    /// shell-invoked launches; ignored on the direct path.
    pub fn verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = Some(verb.into());
        self
    }

    pub fn hide_window(mut self, yes: bool) -> Self {
        self.hide_window = yes;
        self
    }

    pub fn window_style(mut self, style: WindowStyle) -> Self {
        self.window_style = Some(style);
        self
    }

    pub fn priority(mut self, priority: ProcessPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Capture stdout and stderr through pipes. Forces direct creation.
    pub fn redirect_output(mut self, yes: bool) -> Self {
        self.redirect_output = yes;
        self
    }

    /// Also record a single chronological merge of both streams.
    pub fn merge_streams(mut self, yes: bool) -> Self {
        self.merge_streams = yes;
        self
    }

    pub fn encoding(mut self, encoding: StreamEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Whether the cancellation signal kills the whole job (the default) or
    /// merely abandons the wait, leaving the processes running.
    pub fn terminate_on_timeout(mut self, yes: bool) -> Self {
        self.terminate_on_timeout = yes;
        self
    }

    /// Treat the launch as complete only when the job's active-process count
    /// reaches zero, rather than when the direct child exits.
    pub fn wait_for_children(mut self, yes: bool) -> Self {
        self.wait_for_children = yes;
        self
    }

    /// Configure the job so closing its last handle kills every process
    /// still in it.
    pub fn kill_tree_on_close(mut self, yes: bool) -> Self {
        self.kill_tree_on_close = yes;
        self
    }

    /// Attach a cancellation signal. When it fires before the process
    /// exits, the launch transitions to its timeout state.
    #[cfg(windows)]
    pub fn cancellation(mut self, event: CancellationEvent) -> Self {
        self.cancellation = Some(event);
        self
    }

    /// Validates the descriptor and freezes it. All rule violations are
    /// reported as [`Error::Validation`].
    pub fn build(self) -> Result<LaunchDescriptor> {
        let program = resolve_program(self.program, self.mode)?;

        if self.hide_window {
            if let Some(style) = self.window_style {
                if style != WindowStyle::Hidden {
                    return Err(Error::validation(format!(
                        "hide_window conflicts with an explicit {style:?} window style"
                    )));
                }
            }
        }

        if self.redirect_output && self.mode == ExecutionMode::Shell {
            return Err(Error::validation(
                "output redirection is not available for shell-invoked launches",
            ));
        }

        if self.merge_streams && !self.redirect_output {
            return Err(Error::validation(
                "merge_streams requires redirect_output",
            ));
        }

        if self.use_linked_elevated_token && self.target_user.is_none() {
            return Err(Error::validation(
                "use_linked_elevated_token requires a target user",
            ));
        }

        // Abandoning the wait while readers are still attached to the pipes
        // would leave them blocked on a process nobody supervises anymore.
        #[cfg(windows)]
        if !self.terminate_on_timeout && self.redirect_output && self.cancellation.is_some() {
            return Err(Error::validation(
                "disabling terminate_on_timeout is not supported while reading stdout/stderr",
            ));
        }

        let working_directory = match self.working_directory {
            Some(dir) => Some(dir),
            None => program.parent().filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf),
        };

        let command_line = cmdline::compose(&program.to_string_lossy(), &self.args);

        Ok(LaunchDescriptor {
            program,
            args: self.args,
            working_directory,
            target_user: self.target_user,
            use_linked_elevated_token: self.use_linked_elevated_token,
            inherit_environment: self.inherit_environment,
            mode: self.mode,
            verb: self.verb,
            hide_window: self.hide_window,
            window_style: self.window_style,
            priority: self.priority,
            redirect_output: self.redirect_output,
            merge_streams: self.merge_streams,
            encoding: self.encoding,
            terminate_on_timeout: self.terminate_on_timeout,
            wait_for_children: self.wait_for_children,
            kill_tree_on_close: self.kill_tree_on_close,
            command_line,
            #[cfg(windows)]
            cancellation: self.cancellation,
        })
    }
}

/// Unwraps a quoted program path, then makes sure we have something the
/// process-creation call can find: an absolute path, a `%VAR%`-prefixed path
/// the OS will expand, or (for direct launches) a name resolvable on PATH.
fn resolve_program(program: PathBuf, mode: ExecutionMode) -> Result<PathBuf> {
    let text = program.to_string_lossy();
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::validation("program path is empty"));
    }

    let unwrapped = if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        &text[1..text.len() - 1]
    } else {
        text
    };
    let program = PathBuf::from(unwrapped);

    if program.is_absolute() || unwrapped.starts_with('%') || mode == ExecutionMode::Shell {
        return Ok(program);
    }

    #[cfg(windows)]
    {
        which::which(&program).map_err(|_| {
            Error::validation(format!(
                "program {} is neither an absolute path nor found on PATH",
                program.display()
            ))
        })
    }
    #[cfg(not(windows))]
    {
        Err(Error::validation(format!(
            "program {} must be an absolute path",
            program.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(windows)]
    const TOOL: &str = "C:\\Windows\\System32\\cmd.exe";
    #[cfg(not(windows))]
    const TOOL: &str = "/bin/sh";

    #[test]
    fn hidden_plus_maximized_is_rejected() {
        let err = LaunchDescriptor::builder(TOOL)
            .hide_window(true)
            .window_style(WindowStyle::Maximized)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err:?}");
    }

    #[test]
    fn hidden_plus_hidden_style_is_fine() {
        let desc = LaunchDescriptor::builder(TOOL)
            .hide_window(true)
            .window_style(WindowStyle::Hidden)
            .build()
            .unwrap();
        assert!(desc.hide_window());
    }

    #[test]
    fn shell_mode_rejects_redirection() {
        let err = LaunchDescriptor::builder(TOOL)
            .mode(ExecutionMode::Shell)
            .redirect_output(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn merge_requires_redirect() {
        let err = LaunchDescriptor::builder(TOOL)
            .merge_streams(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn linked_token_requires_target_user() {
        let err = LaunchDescriptor::builder(TOOL)
            .use_linked_elevated_token(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn empty_program_is_rejected() {
        let err = LaunchDescriptor::builder("").build().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn relative_program_without_path_hit_is_rejected() {
        let err = LaunchDescriptor::builder("no-such-binary-whatsoever")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn quoted_program_is_unwrapped() {
        let quoted = format!("\"{TOOL}\"");
        let desc = LaunchDescriptor::builder(quoted).build().unwrap();
        assert_eq!(desc.program(), Path::new(TOOL));
    }

    #[test]
    fn working_directory_defaults_to_program_dir() {
        let desc = LaunchDescriptor::builder(TOOL).build().unwrap();
        assert_eq!(
            desc.working_directory(),
            Path::new(TOOL).parent(),
        );
    }

    #[test]
    fn explicit_working_directory_wins() {
        let desc = LaunchDescriptor::builder(TOOL)
            .working_directory("relative/dir")
            .build()
            .unwrap();
        assert_eq!(desc.working_directory(), Some(Path::new("relative/dir")));
    }

    #[test]
    fn command_line_quotes_arguments() {
        let desc = LaunchDescriptor::builder(TOOL)
            .arg("/c")
            .arg("echo hello world")
            .build()
            .unwrap();
        assert_eq!(
            desc.command_line(),
            format!("{TOOL} /c \"echo hello world\"")
        );
    }

    #[cfg(windows)]
    #[test]
    fn no_terminate_with_redirection_and_cancel_is_rejected() {
        use crate::cancel::CancellationEvent;
        let cancel = CancellationEvent::new().unwrap();
        let err = LaunchDescriptor::builder(TOOL)
            .redirect_output(true)
            .terminate_on_timeout(false)
            .cancellation(cancel)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[cfg(windows)]
    #[test]
    fn no_terminate_without_redirection_is_allowed() {
        use crate::cancel::CancellationEvent;
        let cancel = CancellationEvent::new().unwrap();
        let desc = LaunchDescriptor::builder(TOOL)
            .terminate_on_timeout(false)
            .cancellation(cancel)
            .build()
            .unwrap();
        assert!(!desc.terminate_on_timeout());
    }

    #[test]
    fn env_prefixed_program_is_left_for_the_os() {
        let desc = LaunchDescriptor::builder("%SystemRoot%\\system32\\cmd.exe")
            .build()
            .unwrap();
        assert!(desc.program().to_string_lossy().starts_with('%'));
    }
}

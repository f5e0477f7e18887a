//! Picks the creation path for a descriptor, exactly once, up front.

use crate::descriptor::{ExecutionMode, LaunchDescriptor};

/// The two ways a process can come into existence. Chosen by
/// [`select`] before any resource is acquired; nothing downstream
/// re-inspects the descriptor to second-guess it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPath {
    /// `CreateProcessW`/`CreateProcessAsUserW`: supports redirection,
    /// suspension, job assignment before the first instruction, and
    /// launching under another identity.
    Direct,
    /// `ShellExecuteExW`: double-click-equivalent launch that preserves
    /// shell verbs and UAC prompts, but cannot redirect output or target
    /// another user.
    Shell,
}

/// Decides between direct and shell-invoked creation.
///
/// Redirection forces direct creation because the shell cannot redirect
/// output without attaching a visible console. A target identity forces it
/// because `ShellExecuteExW` always runs as the caller. Windowed apps
/// otherwise default to the shell so native behaviors (verbs, UAC) are
/// preserved.
pub(crate) fn select(descriptor: &LaunchDescriptor, windowed: bool) -> CreationPath {
    let shell_wanted = match descriptor.mode() {
        ExecutionMode::Direct => false,
        ExecutionMode::Shell => true,
        ExecutionMode::Auto => windowed,
    };

    if (!windowed && descriptor.hide_window())
        || descriptor.redirect_output()
        || !shell_wanted
        || descriptor.target_user().is_some()
    {
        CreationPath::Direct
    } else {
        CreationPath::Shell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LaunchDescriptor;

    #[cfg(windows)]
    const TOOL: &str = "C:\\Windows\\System32\\cmd.exe";
    #[cfg(not(windows))]
    const TOOL: &str = "/bin/sh";

    fn descriptor(mode: ExecutionMode) -> LaunchDescriptor {
        LaunchDescriptor::builder(TOOL).mode(mode).build().unwrap()
    }

    #[test]
    fn direct_mode_is_always_direct() {
        assert_eq!(select(&descriptor(ExecutionMode::Direct), false), CreationPath::Direct);
        assert_eq!(select(&descriptor(ExecutionMode::Direct), true), CreationPath::Direct);
    }

    #[test]
    fn shell_mode_uses_shell_for_visible_launches() {
        assert_eq!(select(&descriptor(ExecutionMode::Shell), true), CreationPath::Shell);
        assert_eq!(select(&descriptor(ExecutionMode::Shell), false), CreationPath::Shell);
    }

    #[test]
    fn hidden_console_app_never_goes_through_the_shell() {
        let desc = LaunchDescriptor::builder(TOOL)
            .mode(ExecutionMode::Shell)
            .hide_window(true)
            .build()
            .unwrap();
        assert_eq!(select(&desc, false), CreationPath::Direct);
        // A hidden *windowed* app still shell-executes; hiding only forces
        // the direct path for console subsystems.
        assert_eq!(select(&desc, true), CreationPath::Shell);
    }

    #[test]
    fn redirection_forces_direct_creation() {
        // Auto mode would otherwise shell-execute a windowed binary, and the
        // shell cannot carry the pipes.
        let desc = LaunchDescriptor::builder(TOOL)
            .mode(ExecutionMode::Auto)
            .redirect_output(true)
            .build()
            .unwrap();
        assert_eq!(select(&desc, true), CreationPath::Direct);
        assert_eq!(select(&desc, false), CreationPath::Direct);
    }

    #[test]
    fn target_user_forces_direct_creation() {
        let desc = LaunchDescriptor::builder(TOOL)
            .mode(ExecutionMode::Shell)
            .target_user("deploy-svc")
            .build()
            .unwrap();
        assert_eq!(select(&desc, true), CreationPath::Direct);
    }

    #[test]
    fn auto_mode_follows_the_subsystem() {
        assert_eq!(select(&descriptor(ExecutionMode::Auto), true), CreationPath::Shell);
        assert_eq!(select(&descriptor(ExecutionMode::Auto), false), CreationPath::Direct);
    }
}

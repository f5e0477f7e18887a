//! Supervised process launching for deployment automation on Windows.
//!
//! A launch is described once ([`LaunchDescriptor`]), validated up front, and
//! then executed under a job object with an I/O completion port watching it:
//! the whole process tree is tracked, output can be captured line by line,
//! and a cancellation signal kills everything with a recognizable exit code
//! ([`TIMEOUT_EXIT_CODE`]). Launching into another user's interactive
//! session goes through the [`SessionDirectory`] seam.
//!
//! The descriptor, validation, command-line composition, and output decoding
//! are portable; everything that touches the OS is Windows-only.

mod cmdline;
mod descriptor;
mod error;
mod output;
mod result;
mod strategy;

#[cfg(windows)]
mod cancel;
#[cfg(windows)]
mod engine;
#[cfg(windows)]
mod handles;
#[cfg(windows)]
mod pe;
#[cfg(windows)]
mod token;

pub use descriptor::{
    ExecutionMode, LaunchDescriptor, LaunchDescriptorBuilder, ProcessPriority, StreamEncoding,
    WindowStyle,
};
pub use error::{Error, LaunchPhase, Result};
pub use result::{ExecutionResult, TIMEOUT_EXIT_CODE};
pub use strategy::CreationPath;

#[cfg(windows)]
pub use cancel::CancellationEvent;
#[cfg(windows)]
pub use engine::{launch, launch_with, ProcessHandle};
#[cfg(windows)]
pub use handles::{live_resource_count, OwnedHandle};
#[cfg(windows)]
pub use token::{SessionDirectory, WtsSessionDirectory};

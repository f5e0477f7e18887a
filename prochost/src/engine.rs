//! Process creation and supervision.
//!
//! A launch acquires a job object and a completion port, creates the process
//! suspended, assigns it to the job, and only then lets it run. From that
//! point a monitor thread owns every kernel object involved and resolves the
//! launch exactly once: on job exit, on a timeout kill, or by abandoning the
//! wait when termination is disabled.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};
use windows::core::{HSTRING, PCWSTR, PWSTR};
use windows::Win32::Foundation::{HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, TerminateJobObject, JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO,
    JOB_OBJECT_MSG_EXIT_PROCESS,
};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, GetExitCodeProcess, GetProcessId, ResumeThread,
    SetPriorityClass, WaitForMultipleObjects, ABOVE_NORMAL_PRIORITY_CLASS,
    BELOW_NORMAL_PRIORITY_CLASS, CREATE_NEW_CONSOLE, CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW,
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, HIGH_PRIORITY_CLASS, IDLE_PRIORITY_CLASS,
    INFINITE, NORMAL_PRIORITY_CLASS, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    REALTIME_PRIORITY_CLASS, STARTF_USESHOWWINDOW, STARTF_USESTDHANDLES, STARTUPINFOW,
};
use windows::Win32::System::IO::{GetQueuedCompletionStatus, OVERLAPPED};
use windows::Win32::UI::Shell::{
    ShellExecuteExW, SEE_MASK_FLAG_NO_UI, SEE_MASK_NOCLOSEPROCESS, SEE_MASK_NOZONECHECKS,
    SEE_MASK_NO_CONSOLE, SHELLEXECUTEINFOW,
};
use windows::Win32::UI::WindowsAndMessaging::{
    WaitForInputIdle, SHOW_WINDOW_CMD, SW_HIDE, SW_SHOWMAXIMIZED, SW_SHOWMINIMIZED, SW_SHOWNORMAL,
};

use crate::cmdline;
use crate::descriptor::{LaunchDescriptor, ProcessPriority, StreamEncoding, WindowStyle};
use crate::error::{Error, LaunchPhase, Result};
use crate::handles::{
    associate_job_with_port, create_completion_port, create_inheritable_pipe, create_job_object,
    EnvironmentBlock, OwnedHandle, SharedHandle,
};
use crate::output::{drain_pipe, SharedLines};
use crate::pe;
use crate::result::{ExecutionResult, TIMEOUT_EXIT_CODE};
use crate::strategy::{self, CreationPath};
use crate::token::{self, SessionDirectory, WtsSessionDirectory};

/// Launches the described process under supervision, resolving identities
/// through the local session table.
///
/// `Ok(None)` means the work was handed to the shell and there is no process
/// to wait on (for example a verb handled in an existing process).
pub fn launch(descriptor: &LaunchDescriptor) -> Result<Option<ProcessHandle>> {
    launch_with(descriptor, &WtsSessionDirectory)
}

/// Like [`launch`], with a caller-supplied [`SessionDirectory`].
pub fn launch_with(
    descriptor: &LaunchDescriptor,
    directory: &dyn SessionDirectory,
) -> Result<Option<ProcessHandle>> {
    let windowed = pe::is_windowed_app(descriptor.program());
    let path = strategy::select(descriptor, windowed);
    debug!(
        program = %descriptor.program().display(),
        ?path,
        windowed,
        "selected creation path"
    );

    let job = SharedHandle::new(
        create_job_object(descriptor.kill_tree_on_close()).map_err(acquire_error)?,
    );
    let port = SharedHandle::new(create_completion_port().map_err(acquire_error)?);
    associate_job_with_port(&job, &port).map_err(acquire_error)?;

    let mut redirection = if descriptor.redirect_output() {
        Some(Redirection::start(descriptor.encoding())?)
    } else {
        None
    };

    let started = start_process(descriptor, path, windowed, directory, &job, redirection.as_ref());

    // The parent's copies of the pipe write ends must go away now, or the
    // readers would never see end-of-stream.
    if let Some(r) = redirection.as_mut() {
        r.close_write_ends();
    }

    let (process, pid) = match started {
        Ok(Some(pair)) => pair,
        Ok(None) => return Ok(None),
        Err(err) => {
            if let Some(r) = redirection {
                let _ = r.finish();
            }
            return Err(err);
        }
    };

    let supervision = Supervision {
        job,
        port,
        process,
        pid,
        wait_for_children: descriptor.wait_for_children(),
        terminate_on_timeout: descriptor.terminate_on_timeout(),
        include_interleaved: descriptor.merge_streams(),
        cancel: descriptor.cancellation().map(|c| c.share()),
        redirection,
    };

    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let _ = sender.send(supervision.run());
    });

    Ok(Some(ProcessHandle {
        process_id: pid,
        state: Mutex::new(WaitState {
            receiver: Some(receiver),
            outcome: None,
        }),
    }))
}

/// A running supervised launch. Dropping the handle does not affect the
/// process; the monitor keeps running until the launch resolves.
#[derive(Debug)]
pub struct ProcessHandle {
    process_id: u32,
    state: Mutex<WaitState>,
}

#[derive(Debug)]
struct WaitState {
    receiver: Option<mpsc::Receiver<Result<ExecutionResult>>>,
    outcome: Option<Result<ExecutionResult>>,
}

impl ProcessHandle {
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Blocks until the launch reaches its terminal state. The outcome is
    /// resolved exactly once; every later call returns the same value.
    pub fn wait(&self) -> Result<ExecutionResult> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(outcome) = &state.outcome {
            return outcome.clone();
        }
        let outcome = match state.receiver.take() {
            Some(receiver) => receiver.recv().unwrap_or_else(|_| {
                Err(Error::invariant(
                    "supervision ended without delivering a result",
                ))
            }),
            None => Err(Error::invariant("launch wait state lost")),
        };
        state.outcome = Some(outcome.clone());
        outcome
    }
}

fn acquire_error(err: windows::core::Error) -> Error {
    Error::launch(LaunchPhase::AcquireResources, err)
}

fn supervise_error(err: windows::core::Error) -> Error {
    Error::launch(LaunchPhase::StartSupervision, err)
}

fn start_process(
    descriptor: &LaunchDescriptor,
    path: CreationPath,
    windowed: bool,
    directory: &dyn SessionDirectory,
    job: &OwnedHandle,
    redirection: Option<&Redirection>,
) -> Result<Option<(OwnedHandle, u32)>> {
    match path {
        CreationPath::Direct => {
            let token = resolve_token(descriptor, directory)?;
            let (process, thread, pid) =
                create_direct(descriptor, windowed, token.as_ref(), redirection)?;

            // The process is suspended: it joins the job before its first
            // instruction runs, so nothing it spawns can escape.
            unsafe { AssignProcessToJobObject(job.raw(), process.raw()) }
                .map_err(supervise_error)?;
            if unsafe { ResumeThread(thread.raw()) } == u32::MAX {
                return Err(supervise_error(windows::core::Error::from_win32()));
            }
            drop(thread);

            if windowed {
                let idle = unsafe { WaitForInputIdle(process.raw(), 5000) };
                if idle != 0 {
                    warn!(pid, "process did not reach input idle within 5s");
                }
            }
            Ok(Some((process, pid)))
        }
        CreationPath::Shell => {
            let Some((process, pid)) = shell_execute(descriptor)? else {
                return Ok(None);
            };
            unsafe { AssignProcessToJobObject(job.raw(), process.raw()) }
                .map_err(supervise_error)?;
            if let Some(priority) = descriptor.priority() {
                unsafe { SetPriorityClass(process.raw(), priority_class(priority)) }
                    .map_err(supervise_error)?;
            }
            Ok(Some((process, pid)))
        }
    }
}

fn resolve_token(
    descriptor: &LaunchDescriptor,
    directory: &dyn SessionDirectory,
) -> Result<Option<OwnedHandle>> {
    let Some(user) = descriptor.target_user() else {
        return Ok(None);
    };
    let session_token = directory.resolve(user)?;
    token::ensure_primary(&session_token)?;
    let launch_token = if descriptor.use_linked_elevated_token() {
        token::linked_elevated_token(session_token.raw())?
    } else {
        session_token
    };
    token::prepare_launch_privileges();
    Ok(Some(launch_token))
}

fn create_direct(
    descriptor: &LaunchDescriptor,
    windowed: bool,
    token: Option<&OwnedHandle>,
    redirection: Option<&Redirection>,
) -> Result<(OwnedHandle, OwnedHandle, u32)> {
    let mut flags = CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_PROCESS_GROUP;
    if !windowed {
        flags |= if descriptor.hide_window() {
            CREATE_NO_WINDOW
        } else {
            CREATE_NEW_CONSOLE
        };
    }
    if let Some(priority) = descriptor.priority() {
        flags |= priority_class(priority);
    }

    let mut info = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    if let Some(show) = startup_show(descriptor, windowed) {
        info.dwFlags = STARTF_USESHOWWINDOW;
        info.wShowWindow = show.0 as u16;
    }

    // Without a desktop the token launch would land on the service's own
    // window station, invisible to the user.
    let mut desktop = token
        .is_some()
        .then(|| wide(OsStr::new("winsta0\\default")));
    if let Some(buffer) = desktop.as_mut() {
        info.lpDesktop = PWSTR(buffer.as_mut_ptr());
    }

    if let Some(r) = redirection {
        info.dwFlags |= STARTF_USESTDHANDLES;
        info.hStdOutput = r.stdout_write_raw();
        info.hStdError = r.stderr_write_raw();
    }

    let environment = match token {
        Some(token) => Some(
            EnvironmentBlock::for_token(token.raw(), descriptor.inherit_environment())
                .map_err(|e| Error::launch(LaunchPhase::BuildEnvironment, e))?,
        ),
        None => None,
    };

    let mut command = wide(OsStr::new(descriptor.command_line()));
    let directory = descriptor.working_directory().map(|p| wide(p.as_os_str()));
    let directory_ptr = directory
        .as_ref()
        .map(|buffer| PCWSTR(buffer.as_ptr()))
        .unwrap_or_else(PCWSTR::null);

    let mut created = PROCESS_INFORMATION::default();
    let outcome = unsafe {
        match token {
            Some(token) => CreateProcessAsUserW(
                token.raw(),
                PCWSTR::null(),
                PWSTR(command.as_mut_ptr()),
                None,
                None,
                redirection.is_some(),
                flags,
                environment.as_ref().map(|block| block.as_ptr()),
                directory_ptr,
                &info,
                &mut created,
            ),
            None => CreateProcessW(
                PCWSTR::null(),
                PWSTR(command.as_mut_ptr()),
                None,
                None,
                redirection.is_some(),
                flags,
                environment.as_ref().map(|block| block.as_ptr()),
                directory_ptr,
                &info,
                &mut created,
            ),
        }
    };
    outcome.map_err(|e| Error::launch(LaunchPhase::CreateProcess, e))?;

    Ok((
        OwnedHandle::new(created.hProcess),
        OwnedHandle::new(created.hThread),
        created.dwProcessId,
    ))
}

fn shell_execute(descriptor: &LaunchDescriptor) -> Result<Option<(OwnedHandle, u32)>> {
    let file = HSTRING::from(descriptor.program().as_os_str());
    let parameters = HSTRING::from(cmdline::join_args(descriptor.args()));
    let directory = descriptor.working_directory().map(|p| HSTRING::from(p.as_os_str()));
    let verb = descriptor.verb().map(HSTRING::from);

    let mut mask = SEE_MASK_NOCLOSEPROCESS | SEE_MASK_FLAG_NO_UI | SEE_MASK_NOZONECHECKS;
    let show = show_command(descriptor);
    if show == SW_HIDE {
        mask |= SEE_MASK_NO_CONSOLE;
    }

    let mut sei = SHELLEXECUTEINFOW {
        cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
        fMask: mask,
        lpVerb: verb
            .as_ref()
            .map(|v| PCWSTR(v.as_ptr()))
            .unwrap_or_else(PCWSTR::null),
        lpFile: PCWSTR(file.as_ptr()),
        lpParameters: PCWSTR(parameters.as_ptr()),
        lpDirectory: directory
            .as_ref()
            .map(|d| PCWSTR(d.as_ptr()))
            .unwrap_or_else(PCWSTR::null),
        nShow: show.0,
        ..Default::default()
    };
    unsafe { ShellExecuteExW(&mut sei) }
        .map_err(|e| Error::launch(LaunchPhase::CreateProcess, e))?;

    // Some verbs are serviced by an already-running process; there is
    // nothing to supervise then.
    if sei.hProcess == HANDLE::default() || sei.hProcess == INVALID_HANDLE_VALUE {
        debug!(program = %descriptor.program().display(), "shell action returned no process");
        return Ok(None);
    }
    let process = OwnedHandle::new(sei.hProcess);
    let pid = unsafe { GetProcessId(process.raw()) };
    Ok(Some((process, pid)))
}

/// The redirected-output half of a launch: two pipes and the reader threads
/// draining them. Readers start before the process exists so no early output
/// is lost.
struct Redirection {
    stdout_write: Option<OwnedHandle>,
    stderr_write: Option<OwnedHandle>,
    stdout_reader: JoinHandle<Result<Vec<String>>>,
    stderr_reader: JoinHandle<Result<Vec<String>>>,
    interleaved: SharedLines,
}

impl Redirection {
    fn start(encoding: StreamEncoding) -> Result<Self> {
        let (stdout_read, stdout_write) = create_inheritable_pipe().map_err(acquire_error)?;
        let (stderr_read, stderr_write) = create_inheritable_pipe().map_err(acquire_error)?;
        let interleaved = SharedLines::default();

        let merged = interleaved.clone();
        let stdout_reader = thread::spawn(move || drain_pipe(stdout_read, encoding, merged));
        let merged = interleaved.clone();
        let stderr_reader = thread::spawn(move || drain_pipe(stderr_read, encoding, merged));

        Ok(Self {
            stdout_write: Some(stdout_write),
            stderr_write: Some(stderr_write),
            stdout_reader,
            stderr_reader,
            interleaved,
        })
    }

    fn stdout_write_raw(&self) -> HANDLE {
        self.stdout_write.as_ref().map(|h| h.raw()).unwrap_or_default()
    }

    fn stderr_write_raw(&self) -> HANDLE {
        self.stderr_write.as_ref().map(|h| h.raw()).unwrap_or_default()
    }

    fn close_write_ends(&mut self) {
        self.stdout_write.take();
        self.stderr_write.take();
    }

    /// Joins both readers and hands back the captured sequences.
    fn finish(self) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
        let stdout = join_reader(self.stdout_reader)?;
        let stderr = join_reader(self.stderr_reader)?;
        let interleaved = match self.interleaved.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        Ok((stdout, stderr, interleaved))
    }
}

fn join_reader(reader: JoinHandle<Result<Vec<String>>>) -> Result<Vec<String>> {
    reader
        .join()
        .map_err(|_| Error::invariant("output reader panicked"))?
}

enum Resolution {
    Exited,
    Abandoned,
}

/// Everything the monitor thread owns while a launch is in flight.
struct Supervision {
    job: SharedHandle,
    port: SharedHandle,
    process: OwnedHandle,
    pid: u32,
    wait_for_children: bool,
    terminate_on_timeout: bool,
    include_interleaved: bool,
    cancel: Option<SharedHandle>,
    redirection: Option<Redirection>,
}

impl Supervision {
    fn run(mut self) -> Result<ExecutionResult> {
        let resolution = match self.watch() {
            Ok(resolution) => Ok(resolution),
            Err(err) => {
                // A job the monitor can no longer observe must not keep
                // running unobserved.
                unsafe {
                    let _ = TerminateJobObject(self.job.raw(), 1);
                }
                Err(err)
            }
        };

        // Readers drain to end-of-stream once the job is done; they always
        // finish before a result exists.
        let (stdout, stderr, interleaved) = match self.redirection.take() {
            Some(redirection) => redirection.finish()?,
            None => (Vec::new(), Vec::new(), Vec::new()),
        };

        let exit_code = match resolution? {
            Resolution::Exited => Some(self.exit_code()?),
            Resolution::Abandoned => None,
        };
        debug!(pid = self.pid, ?exit_code, "launch resolved");

        Ok(ExecutionResult::new(
            self.pid,
            exit_code,
            stdout,
            stderr,
            if self.include_interleaved {
                interleaved
            } else {
                Vec::new()
            },
        ))
    }

    fn watch(&self) -> Result<Resolution> {
        let mut waits: Vec<HANDLE> = vec![self.port.raw()];
        if let Some(cancel) = &self.cancel {
            waits.push(cancel.raw());
        }

        loop {
            let signaled = unsafe { WaitForMultipleObjects(&waits, false, INFINITE) };
            if signaled == WAIT_OBJECT_0 {
                let mut message = 0u32;
                let mut key = 0usize;
                let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
                let dequeued = unsafe {
                    GetQueuedCompletionStatus(
                        self.port.raw(),
                        &mut message,
                        &mut key,
                        &mut overlapped,
                        0,
                    )
                };
                let Ok(()) = dequeued else {
                    // Raced an already-drained port; wait again.
                    continue;
                };
                if message == JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO {
                    return Ok(Resolution::Exited);
                }
                // The message payload for exit notifications is the pid.
                if message == JOB_OBJECT_MSG_EXIT_PROCESS
                    && !self.wait_for_children
                    && overlapped as usize == self.pid as usize
                {
                    return Ok(Resolution::Exited);
                }
            } else if waits.len() == 2 && signaled.0 == WAIT_OBJECT_0.0 + 1 {
                if !self.terminate_on_timeout {
                    warn!(pid = self.pid, "cancelled; leaving the process running");
                    return Ok(Resolution::Abandoned);
                }
                debug!(pid = self.pid, "cancelled; terminating job");
                unsafe { TerminateJobObject(self.job.raw(), TIMEOUT_EXIT_CODE as u32) }
                    .map_err(|e| Error::launch(LaunchPhase::Monitor, e))?;
                // The event stays signaled; from here only the port matters.
                waits.truncate(1);
            } else {
                return Err(Error::invariant(format!(
                    "unexpected wait result {:#x} while supervising the job",
                    signaled.0
                )));
            }
        }
    }

    /// Read exactly once, after the terminal notification.
    fn exit_code(&self) -> Result<i32> {
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(self.process.raw(), &mut code) }
            .map_err(|e| Error::launch(LaunchPhase::Monitor, e))?;
        Ok(code as i32)
    }
}

/// The show command for the startup info, or `None` when the launch relies
/// on `CREATE_NO_WINDOW` instead: that flag alone hides the console, while
/// forcing `SW_HIDE` through the startup info would also hide any UI the
/// console app goes on to create.
fn startup_show(descriptor: &LaunchDescriptor, windowed: bool) -> Option<SHOW_WINDOW_CMD> {
    if !windowed && descriptor.hide_window() {
        return None;
    }
    Some(show_command(descriptor))
}

fn show_command(descriptor: &LaunchDescriptor) -> SHOW_WINDOW_CMD {
    if descriptor.hide_window() {
        return SW_HIDE;
    }
    match descriptor.window_style().unwrap_or_default() {
        WindowStyle::Normal => SW_SHOWNORMAL,
        WindowStyle::Hidden => SW_HIDE,
        WindowStyle::Minimized => SW_SHOWMINIMIZED,
        WindowStyle::Maximized => SW_SHOWMAXIMIZED,
    }
}

fn priority_class(priority: ProcessPriority) -> PROCESS_CREATION_FLAGS {
    match priority {
        ProcessPriority::Idle => IDLE_PRIORITY_CLASS,
        ProcessPriority::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
        ProcessPriority::Normal => NORMAL_PRIORITY_CLASS,
        ProcessPriority::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
        ProcessPriority::High => HIGH_PRIORITY_CLASS,
        ProcessPriority::Realtime => REALTIME_PRIORITY_CLASS,
    }
}

fn wide(text: &OsStr) -> Vec<u16> {
    text.encode_wide().chain(std::iter::once(0)).collect()
}

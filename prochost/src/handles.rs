//! Owned wrappers around the kernel objects a launch acquires.
//!
//! Every wrapper owns exactly one handle and releases it exactly once, on
//! every exit path. Handles that are legitimately shared between the
//! launching call and a background task travel as [`SharedHandle`], so a
//! release can never race a live use.

use std::ffi::c_void;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, SetHandleInformation, HANDLE, HANDLE_FLAGS, HANDLE_FLAG_INHERIT,
    INVALID_HANDLE_VALUE,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::JobObjects::{
    CreateJobObjectW, SetInformationJobObject, JobObjectAssociateCompletionPortInformation,
    JobObjectExtendedLimitInformation, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::CreateEventW;
use windows::Win32::System::IO::CreateIoCompletionPort;

/// Count of kernel objects currently alive in this process. Backs the
/// resource-symmetry tests; not part of the public API.
static LIVE_RESOURCES: AtomicIsize = AtomicIsize::new(0);

/// The number of wrapped kernel objects not yet released.
#[doc(hidden)]
pub fn live_resource_count() -> isize {
    LIVE_RESOURCES.load(Ordering::SeqCst)
}

/// A single kernel handle, closed exactly once when dropped.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

// Kernel handles are process-global identifiers; moving one to the monitor
// or reader thread is how ownership transfers here.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    pub(crate) fn new(handle: HANDLE) -> Self {
        LIVE_RESOURCES.fetch_add(1, Ordering::SeqCst);
        Self(handle)
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
        LIVE_RESOURCES.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A reference-counted handle for the job object, completion port, and
/// cancellation event: each is shared between the launching call and exactly
/// one background task.
pub(crate) type SharedHandle = Arc<OwnedHandle>;

/// Creates an unnamed job object, optionally configured so that closing its
/// last handle kills everything still assigned to it.
pub(crate) fn create_job_object(kill_on_close: bool) -> windows::core::Result<OwnedHandle> {
    unsafe {
        let job = OwnedHandle::new(CreateJobObjectW(None, PCWSTR::null())?);
        if kill_on_close {
            let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            SetInformationJobObject(
                job.raw(),
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )?;
        }
        Ok(job)
    }
}

/// Creates a completion port with a single concurrent reader: the monitor
/// thread.
pub(crate) fn create_completion_port() -> windows::core::Result<OwnedHandle> {
    unsafe {
        Ok(OwnedHandle::new(CreateIoCompletionPort(
            INVALID_HANDLE_VALUE,
            HANDLE::default(),
            0,
            1,
        )?))
    }
}

/// Binds the job to the port so job-state messages (process exit,
/// active-process-zero) are posted to it.
pub(crate) fn associate_job_with_port(
    job: &OwnedHandle,
    port: &OwnedHandle,
) -> windows::core::Result<()> {
    unsafe {
        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: std::ptr::null_mut(),
            CompletionPort: port.raw(),
        };
        SetInformationJobObject(
            job.raw(),
            JobObjectAssociateCompletionPortInformation,
            &association as *const _ as *const c_void,
            std::mem::size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as u32,
        )
    }
}

/// Creates an anonymous pipe whose write end the child inherits as stdout or
/// stderr. The read end stays private to this process.
pub(crate) fn create_inheritable_pipe() -> windows::core::Result<(OwnedHandle, OwnedHandle)> {
    unsafe {
        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: std::ptr::null_mut(),
            bInheritHandle: true.into(),
        };
        let mut read = HANDLE::default();
        let mut write = HANDLE::default();
        CreatePipe(&mut read, &mut write, Some(&attributes), 0)?;
        let read = OwnedHandle::new(read);
        let write = OwnedHandle::new(write);
        SetHandleInformation(read.raw(), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0))?;
        Ok((read, write))
    }
}

/// Creates an unnamed manual-reset event, initially unsignaled.
pub(crate) fn create_manual_reset_event() -> windows::core::Result<OwnedHandle> {
    unsafe {
        Ok(OwnedHandle::new(CreateEventW(
            None,
            true,
            false,
            PCWSTR::null(),
        )?))
    }
}

/// The environment block for a token launch. Without one, a process created
/// from the SYSTEM context would inherit SYSTEM's environment instead of the
/// target user's.
pub(crate) struct EnvironmentBlock(*mut c_void);

unsafe impl Send for EnvironmentBlock {}

impl EnvironmentBlock {
    /// Builds the block for the given user token, optionally merging in the
    /// caller's environment.
    pub(crate) fn for_token(token: HANDLE, inherit_caller: bool) -> windows::core::Result<Self> {
        unsafe {
            let mut block: *mut c_void = std::ptr::null_mut();
            CreateEnvironmentBlock(&mut block, token, inherit_caller)?;
            LIVE_RESOURCES.fetch_add(1, Ordering::SeqCst);
            Ok(Self(block))
        }
    }

    pub(crate) fn as_ptr(&self) -> *const c_void {
        self.0
    }
}

impl Drop for EnvironmentBlock {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyEnvironmentBlock(self.0);
        }
        LIVE_RESOURCES.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};

    #[test]
    fn pipe_pair_carries_bytes() {
        let (read, write) = create_inheritable_pipe().unwrap();
        let payload = b"hello";
        let mut written = 0u32;
        unsafe {
            WriteFile(write.raw(), Some(payload), Some(&mut written), None).unwrap();
        }
        assert_eq!(written as usize, payload.len());

        drop(write);
        let mut buffer = [0u8; 16];
        let mut read_bytes = 0u32;
        unsafe {
            ReadFile(read.raw(), Some(&mut buffer), Some(&mut read_bytes), None).unwrap();
        }
        assert_eq!(&buffer[..read_bytes as usize], payload);
    }

    #[test]
    fn job_and_port_associate() {
        let job = create_job_object(false).unwrap();
        let port = create_completion_port().unwrap();
        associate_job_with_port(&job, &port).unwrap();
    }

    #[test]
    fn kill_on_close_limit_is_accepted() {
        let job = create_job_object(true).unwrap();
        drop(job);
    }
}

//! Identity resolution for launches under another logged-on user.
//!
//! The directory maps a user name to a primary access token for that user's
//! active session. Resolution is deliberate: it needs SeTcbPrivilege, and a
//! caller without it gets an authorization error up front rather than an
//! opaque failure out of process creation.

use std::ffi::c_void;

use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{GetLastError, ERROR_NOT_ALL_ASSIGNED, HANDLE, LUID};
use windows::Win32::Security::{
    AdjustTokenPrivileges, DuplicateTokenEx, GetTokenInformation, LookupPrivilegeValueW,
    SecurityIdentification, TokenElevation, TokenLinkedToken, TokenPrimary, TokenPrivileges,
    TokenType, LUID_AND_ATTRIBUTES, SE_ASSIGNPRIMARYTOKEN_NAME, SE_INCREASE_QUOTA_NAME,
    SE_PRIVILEGE_ENABLED, SE_TCB_NAME, TOKEN_ACCESS_MASK, TOKEN_ADJUST_PRIVILEGES,
    TOKEN_ALL_ACCESS, TOKEN_ELEVATION, TOKEN_INFORMATION_CLASS, TOKEN_LINKED_TOKEN,
    TOKEN_PRIVILEGES, TOKEN_QUERY, TOKEN_TYPE,
};
use windows::Win32::System::RemoteDesktop::{
    WTSActive, WTSDomainName, WTSEnumerateSessionsW, WTSFreeMemory,
    WTSQuerySessionInformationW, WTSQueryUserToken, WTSUserName, WTS_CURRENT_SERVER_HANDLE,
    WTS_INFO_CLASS, WTS_SESSION_INFOW,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use crate::error::{Error, LaunchPhase, Result};
use crate::handles::OwnedHandle;

/// Maps a logged-on user to a primary token for their active session.
///
/// The default implementation is [`WtsSessionDirectory`]; tests and embedders
/// with their own notion of "the target user" substitute their own.
pub trait SessionDirectory: Send + Sync {
    /// Resolves `user` (either `name` or `DOMAIN\name`, case-insensitive) to
    /// a primary token for that user's active session.
    fn resolve(&self, user: &str) -> Result<OwnedHandle>;
}

/// [`SessionDirectory`] backed by the local Remote Desktop Services session
/// table.
#[derive(Debug, Default)]
pub struct WtsSessionDirectory;

impl SessionDirectory for WtsSessionDirectory {
    fn resolve(&self, user: &str) -> Result<OwnedHandle> {
        if !caller_holds(SE_TCB_NAME).map_err(resolve_error)? {
            return Err(Error::authorization(
                "launching as another user requires SeTcbPrivilege",
            ));
        }

        let (want_domain, want_name) = split_account(user);
        let sessions = Sessions::enumerate().map_err(resolve_error)?;
        for session in sessions.iter() {
            if session.State != WTSActive {
                continue;
            }
            let name = query_session_string(session.SessionId, WTSUserName)
                .map_err(resolve_error)?;
            if !name.eq_ignore_ascii_case(want_name) {
                continue;
            }
            if let Some(domain) = want_domain {
                let session_domain = query_session_string(session.SessionId, WTSDomainName)
                    .map_err(resolve_error)?;
                if !session_domain.eq_ignore_ascii_case(domain) {
                    continue;
                }
            }

            debug!(session = session.SessionId, user, "resolved active session");
            let mut raw = HANDLE::default();
            unsafe {
                WTSQueryUserToken(session.SessionId, &mut raw).map_err(resolve_error)?;
            }
            let session_token = OwnedHandle::new(raw);
            return duplicate_as_primary(session_token.raw()).map_err(resolve_error);
        }

        Err(Error::authorization(format!(
            "no active session for user {user:?}"
        )))
    }
}

fn resolve_error(err: windows::core::Error) -> Error {
    Error::launch(LaunchPhase::ResolveIdentity, err)
}

/// Splits `DOMAIN\name` into its parts; a bare name matches any domain.
fn split_account(user: &str) -> (Option<&str>, &str) {
    match user.split_once('\\') {
        Some((domain, name)) => (Some(domain), name),
        None => (None, user),
    }
}

/// Enumerated WTS sessions, freed when dropped.
struct Sessions {
    list: *mut WTS_SESSION_INFOW,
    count: u32,
}

impl Sessions {
    fn enumerate() -> windows::core::Result<Self> {
        unsafe {
            let mut list = std::ptr::null_mut();
            let mut count = 0u32;
            WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut list, &mut count)?;
            Ok(Self { list, count })
        }
    }

    fn iter(&self) -> impl Iterator<Item = &WTS_SESSION_INFOW> {
        unsafe { std::slice::from_raw_parts(self.list, self.count as usize) }.iter()
    }
}

impl Drop for Sessions {
    fn drop(&mut self) {
        unsafe { WTSFreeMemory(self.list as *mut c_void) }
    }
}

fn query_session_string(session_id: u32, class: WTS_INFO_CLASS) -> windows::core::Result<String> {
    unsafe {
        let mut buffer = windows::core::PWSTR::null();
        let mut bytes = 0u32;
        WTSQuerySessionInformationW(
            WTS_CURRENT_SERVER_HANDLE,
            session_id,
            class,
            &mut buffer,
            &mut bytes,
        )?;
        let text = buffer.to_string().unwrap_or_default();
        WTSFreeMemory(buffer.as_ptr() as *mut c_void);
        Ok(text)
    }
}

/// Duplicates any access token into a primary token suitable for
/// `CreateProcessAsUserW`.
pub(crate) fn duplicate_as_primary(token: HANDLE) -> windows::core::Result<OwnedHandle> {
    unsafe {
        let mut duplicated = HANDLE::default();
        DuplicateTokenEx(
            token,
            TOKEN_ALL_ACCESS,
            None,
            SecurityIdentification,
            TokenPrimary,
            &mut duplicated,
        )?;
        Ok(OwnedHandle::new(duplicated))
    }
}

/// Verifies that a directory handed back a primary token. An impersonation
/// token here is a directory bug, not a recoverable condition.
pub(crate) fn ensure_primary(token: &OwnedHandle) -> Result<()> {
    let kind: TOKEN_TYPE = token_info(token.raw())
        .map_err(|e| Error::launch(LaunchPhase::ResolveIdentity, e))?;
    if kind != TokenPrimary {
        return Err(Error::invariant(
            "session directory returned an impersonation token",
        ));
    }
    Ok(())
}

/// The elevated twin of a filtered (UAC-split) user token, as a primary
/// token. Refuses rather than silently handing back an unelevated token.
pub(crate) fn linked_elevated_token(token: HANDLE) -> Result<OwnedHandle> {
    let linked: TOKEN_LINKED_TOKEN =
        token_info(token).map_err(|e| Error::launch(LaunchPhase::ResolveIdentity, e))?;
    let linked = OwnedHandle::new(linked.LinkedToken);

    let elevation: TOKEN_ELEVATION = token_info(linked.raw())
        .map_err(|e| Error::launch(LaunchPhase::ResolveIdentity, e))?;
    if elevation.TokenIsElevated == 0 {
        return Err(Error::authorization(
            "the user's linked token is not elevated",
        ));
    }
    duplicate_as_primary(linked.raw()).map_err(|e| Error::launch(LaunchPhase::ResolveIdentity, e))
}

/// Enables the privileges `CreateProcessAsUserW` wants on the calling
/// process. Missing privileges are logged and tolerated; the launch itself
/// reports the authoritative failure if they turn out to matter.
pub(crate) fn prepare_launch_privileges() {
    for name in [SE_INCREASE_QUOTA_NAME, SE_ASSIGNPRIMARYTOKEN_NAME] {
        let label = unsafe { name.to_string() }.unwrap_or_default();
        match enable_privilege(name) {
            Ok(true) => {}
            Ok(false) => debug!(privilege = %label, "privilege not held by this process"),
            Err(err) => debug!(privilege = %label, error = %err, "failed to adjust privilege"),
        }
    }
}

fn current_process_token(access: TOKEN_ACCESS_MASK) -> windows::core::Result<OwnedHandle> {
    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), access, &mut token)?;
        Ok(OwnedHandle::new(token))
    }
}

/// Whether the calling process's token carries the named privilege, enabled
/// or not.
pub(crate) fn caller_holds(privilege: PCWSTR) -> windows::core::Result<bool> {
    unsafe {
        let mut wanted = LUID::default();
        LookupPrivilegeValueW(PCWSTR::null(), privilege, &mut wanted)?;

        let token = current_process_token(TOKEN_QUERY)?;
        let mut size = 0u32;
        let _ = GetTokenInformation(token.raw(), TokenPrivileges, None, 0, &mut size);
        let mut buffer = vec![0u8; size as usize];
        GetTokenInformation(
            token.raw(),
            TokenPrivileges,
            Some(buffer.as_mut_ptr() as *mut c_void),
            size,
            &mut size,
        )?;

        let held = &*(buffer.as_ptr() as *const TOKEN_PRIVILEGES);
        let entries: &[LUID_AND_ATTRIBUTES] =
            std::slice::from_raw_parts(held.Privileges.as_ptr(), held.PrivilegeCount as usize);
        Ok(entries
            .iter()
            .any(|p| p.Luid.LowPart == wanted.LowPart && p.Luid.HighPart == wanted.HighPart))
    }
}

/// Enables one privilege on the calling process's token. `Ok(false)` means
/// the token does not hold it at all.
fn enable_privilege(name: PCWSTR) -> windows::core::Result<bool> {
    unsafe {
        let mut luid = LUID::default();
        LookupPrivilegeValueW(PCWSTR::null(), name, &mut luid)?;

        let token = current_process_token(TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY)?;
        let state = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        AdjustTokenPrivileges(token.raw(), false, Some(&state), 0, None, None)?;
        // Succeeds even when nothing was assigned; the thread error code
        // carries the distinction.
        Ok(GetLastError() != ERROR_NOT_ALL_ASSIGNED)
    }
}

// helper trait to get the TOKEN_INFORMATION_CLASS for a given type
trait TokenInfo {
    fn info_class() -> TOKEN_INFORMATION_CLASS;
}
impl TokenInfo for TOKEN_TYPE {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenType
    }
}
impl TokenInfo for TOKEN_ELEVATION {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenElevation
    }
}
impl TokenInfo for TOKEN_LINKED_TOKEN {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenLinkedToken
    }
}

fn token_info<T: TokenInfo>(token: HANDLE) -> windows::core::Result<T> {
    unsafe {
        let mut info: T = std::mem::zeroed();
        let size = std::mem::size_of::<T>() as u32;
        let mut ret_size = size;
        GetTokenInformation(
            token,
            T::info_class(),
            Some(&mut info as *mut _ as _),
            size,
            &mut ret_size,
        )?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_account_handles_both_forms() {
        assert_eq!(split_account("CONTOSO\\deploy"), (Some("CONTOSO"), "deploy"));
        assert_eq!(split_account("deploy"), (None, "deploy"));
    }

    #[test]
    fn own_token_is_primary_after_duplication() {
        let token = current_process_token(TOKEN_ALL_ACCESS).unwrap();
        let primary = duplicate_as_primary(token.raw()).unwrap();
        ensure_primary(&primary).unwrap();
    }

    #[test]
    fn privilege_query_succeeds() {
        // Whether it is held depends on the test runner; the lookup itself
        // must not fail.
        caller_holds(SE_TCB_NAME).unwrap();
    }

    #[test]
    fn unknown_user_is_an_authorization_error() {
        let directory = WtsSessionDirectory;
        let err = directory
            .resolve("prochost_no_such_user_3f9c")
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }
}

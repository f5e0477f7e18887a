//! Minimal PE-header introspection: the one bit the launcher needs is
//! whether a binary targets the GUI subsystem, which drives both the
//! creation-path choice and console-window handling.

use std::fs::File;
use std::mem::{size_of, MaybeUninit};
use std::os::windows::fs::FileExt;
use std::path::Path;
use std::slice::from_raw_parts_mut;

use windows::core::Result;
use windows::Win32::Foundation::{ERROR_BAD_EXE_FORMAT, ERROR_HANDLE_EOF};
use windows::Win32::System::Diagnostics::Debug::{
    IMAGE_NT_HEADERS32, IMAGE_SUBSYSTEM, IMAGE_SUBSYSTEM_WINDOWS_GUI,
};
use windows::Win32::System::SystemServices::{
    IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
};

/// Whether the binary at `path` is a windowed (GUI-subsystem) application.
/// Anything that cannot be classified counts as not windowed.
pub fn is_windowed_app<P: AsRef<Path>>(path: P) -> bool {
    matches!(subsystem(path.as_ref()), Ok(IMAGE_SUBSYSTEM_WINDOWS_GUI))
}

fn subsystem(path: &Path) -> Result<IMAGE_SUBSYSTEM> {
    let file = File::open(path)?;

    let dos: IMAGE_DOS_HEADER = read_at(&file, 0)?;
    if dos.e_magic != IMAGE_DOS_SIGNATURE {
        return Err(ERROR_BAD_EXE_FORMAT.into());
    }

    // IMAGE_NT_HEADERS32 and IMAGE_NT_HEADERS64 differ in size, but the
    // offset of OptionalHeader.Subsystem is the same in both.
    let nt: IMAGE_NT_HEADERS32 = read_at(&file, dos.e_lfanew as u64)?;
    if nt.Signature != IMAGE_NT_SIGNATURE {
        return Err(ERROR_BAD_EXE_FORMAT.into());
    }

    Ok(nt.OptionalHeader.Subsystem)
}

fn read_at<T>(file: &File, offset: u64) -> Result<T> {
    let mut value = MaybeUninit::<T>::uninit();
    let bytes =
        unsafe { from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>()) };
    let read = file.seek_read(bytes, offset)?;
    if read != bytes.len() {
        return Err(ERROR_HANDLE_EOF.into());
    }
    Ok(unsafe { value.assume_init() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cmd_is_not_windowed() {
        assert!(!is_windowed_app(r"C:\Windows\System32\cmd.exe"));
    }

    #[test]
    fn notepad_is_windowed() {
        assert!(is_windowed_app(r"C:\Windows\notepad.exe"));
    }

    #[test]
    fn missing_file_is_not_windowed() {
        assert!(!is_windowed_app(r"C:\does\not\exist.exe"));
    }

    #[test]
    fn garbage_file_is_not_windowed() {
        let path = std::env::temp_dir().join("prochost_pe_garbage.bin");
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(b"definitely not a portable executable").unwrap();
        }
        assert!(!is_windowed_app(&path));
        let _ = std::fs::remove_file(&path);
    }
}

//! Windows code page decoding for captured console output.

/// `CP_ACP`: the system's active ANSI code page.
pub const ANSI: u32 = 0;

/// `CP_UTF8`.
pub const UTF8: u32 = 65001;

#[cfg(windows)]
pub(super) fn decode(page: u32, bytes: &[u8]) -> Option<String> {
    use std::ptr;
    use windows_sys::Win32::Globalization::{MultiByteToWideChar, MB_ERR_INVALID_CHARS};

    if bytes.is_empty() {
        return Some(String::new());
    }
    let len = i32::try_from(bytes.len()).ok()?;

    // SAFETY: the input pointer and length describe `bytes`. A null output
    // buffer with zero capacity only queries the required length.
    let needed = unsafe {
        MultiByteToWideChar(page, MB_ERR_INVALID_CHARS, bytes.as_ptr(), len, ptr::null_mut(), 0)
    };
    if needed <= 0 {
        return None;
    }

    let mut wide = vec![0u16; needed as usize];
    // SAFETY: `wide` has room for exactly `needed` UTF-16 units.
    let written = unsafe {
        MultiByteToWideChar(
            page,
            MB_ERR_INVALID_CHARS,
            bytes.as_ptr(),
            len,
            wide.as_mut_ptr(),
            needed,
        )
    };
    if written <= 0 {
        return None;
    }
    wide.truncate(written as usize);
    String::from_utf16(&wide).ok()
}

/// Off Windows only the UTF-8 code page can be decoded.
#[cfg(not(windows))]
pub(super) fn decode(page: u32, bytes: &[u8]) -> Option<String> {
    match page {
        UTF8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
        _ => None,
    }
}

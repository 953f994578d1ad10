use std::fs::OpenOptions;

/// The subset of open(2) flags the adapter understands and is willing to
/// forward to the host. Everything else (e.g. `O_DIRECT`, `O_NOATIME`) is
/// stripped rather than passed through blind.
#[derive(Debug, Clone, Copy)]
pub struct SanitizedFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

pub fn sanitize(flags: i32) -> SanitizedFlags {
    let access_mode = flags & libc::O_ACCMODE;
    SanitizedFlags {
        read: access_mode == libc::O_RDONLY || access_mode == libc::O_RDWR,
        write: access_mode == libc::O_WRONLY || access_mode == libc::O_RDWR,
        append: flags & libc::O_APPEND != 0,
        truncate: flags & libc::O_TRUNC != 0,
    }
}

impl SanitizedFlags {
    pub fn to_open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(self.read);
        options.write(self.write);
        options.append(self.append);
        if self.truncate {
            options.truncate(true);
        }
        options
    }
}

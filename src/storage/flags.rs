//! Open flags
//!
//! Bit values follow Linux `open(2)`, which is what clients put on the wire.

use bitflags::bitflags;
use tokio::fs::OpenOptions;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const WRONLY = 0x1;
        const RDWR = 0x2;
        const CREATE = 0x40;
        const EXCL = 0x80;
        const TRUNC = 0x200;
        const APPEND = 0x400;
        const SYNC = 0x101000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    /// Keeps known bits only.
    pub fn from_wire(raw: i32) -> Self {
        OpenFlags::from_bits_truncate(raw)
    }

    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }

    /// Whether a successful open is guaranteed to have created the file.
    pub fn creates_new(self) -> bool {
        self.contains(OpenFlags::CREATE | OpenFlags::EXCL)
    }

    /// Maps the flags onto `OpenOptions`. Creation and truncation are only
    /// applied with write access; `Filesystem::open_file` handles the
    /// read-only combinations.
    pub fn to_open_options(self, mode: u32) -> OpenOptions {
        let writable = self.writable();
        let mut options = OpenOptions::new();
        options
            .read(self.readable())
            .write(writable)
            .append(writable && self.contains(OpenFlags::APPEND))
            .truncate(writable && self.contains(OpenFlags::TRUNC));

        if writable && self.creates_new() {
            options.create_new(true);
        } else if writable && self.contains(OpenFlags::CREATE) {
            options.create(true);
        }

        #[cfg(unix)]
        {
            options.mode(mode);
            #[cfg(target_os = "linux")]
            if self.contains(OpenFlags::SYNC) {
                options.custom_flags(OpenFlags::SYNC.bits());
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        options
    }
}

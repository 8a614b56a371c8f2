//! Wire constants
//!
//! Opcodes, status bytes, and small enumerations carried in requests.
//! Opcode groups occupy disjoint ranges so a desynchronized stream is
//! unlikely to decode as a valid opcode.

/// Name carried in the `Upgrade` header.
pub const PROTOCOL_NAME: &str = "Byfs-Stream";
/// Header disclosing the per-connection token, and carrying HTTP proofs.
pub const AUTH_HEADER: &str = "Byfs-Auth";
pub const VERSION_HEADER: &str = "Byfs-Version";
pub const PROTOCOL_VERSION: &str = "1";

pub const STATUS_OK: u8 = 0;
pub const STATUS_FAIL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Auth = 8888,
    Close = 9999,

    FileOpen = 1,
    FileRead = 2,
    FileWrite = 3,
    FileLock = 4,
    FileUnlock = 5,
    FileSeek = 6,
    FileStat = 7,
    FileFlush = 8,
    FileTruncate = 9,
    FileClose = 10,

    DirOpen = 1001,
    DirRead = 1002,
    DirClose = 1003,

    Mkdir = 2001,
    Rmdir = 2002,
    Rename = 2003,
    Stat = 2004,
    Lstat = 2005,
}

impl TryFrom<u16> for Opcode {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        let op = match code {
            8888 => Opcode::Auth,
            9999 => Opcode::Close,
            1 => Opcode::FileOpen,
            2 => Opcode::FileRead,
            3 => Opcode::FileWrite,
            4 => Opcode::FileLock,
            5 => Opcode::FileUnlock,
            6 => Opcode::FileSeek,
            7 => Opcode::FileStat,
            8 => Opcode::FileFlush,
            9 => Opcode::FileTruncate,
            10 => Opcode::FileClose,
            1001 => Opcode::DirOpen,
            1002 => Opcode::DirRead,
            1003 => Opcode::DirClose,
            2001 => Opcode::Mkdir,
            2002 => Opcode::Rmdir,
            2003 => Opcode::Rename,
            2004 => Opcode::Stat,
            2005 => Opcode::Lstat,
            other => return Err(other),
        };
        Ok(op)
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> u16 {
        op as u16
    }
}

/// `FILE_SEEK` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl TryFrom<u8> for Whence {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            other => Err(other),
        }
    }
}

/// `FILE_LOCK` mode, numbered like `flock(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl TryFrom<u8> for LockMode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(LockMode::Shared),
            2 => Ok(LockMode::Exclusive),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip_values() {
        for op in [
            Opcode::Auth,
            Opcode::Close,
            Opcode::FileOpen,
            Opcode::FileTruncate,
            Opcode::FileClose,
            Opcode::DirRead,
            Opcode::Lstat,
        ] {
            assert_eq!(Opcode::try_from(u16::from(op)), Ok(op));
        }
    }

    #[test]
    fn test_unknown_opcodes() {
        for code in [0, 11, 1000, 1004, 2000, 2006, 8887, 65535] {
            assert_eq!(Opcode::try_from(code), Err(code));
        }
    }

    #[test]
    fn test_whence_and_lock_mode() {
        assert_eq!(Whence::try_from(2), Ok(Whence::End));
        assert_eq!(Whence::try_from(3), Err(3));
        assert_eq!(LockMode::try_from(1), Ok(LockMode::Shared));
        assert_eq!(LockMode::try_from(8), Err(8));
    }
}

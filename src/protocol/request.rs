//! Request decoding
//!
//! Each opcode is followed by a fixed set of header fields. Decoding reads
//! all of them before anything is validated, so a rejected request never
//! leaves unread bytes behind. Strings stay raw until the engine checks them.

use tokio::io::AsyncRead;

use crate::error::CodecError;
use crate::protocol::codec::WireReader;
use crate::protocol::codes::Opcode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    FileOpen { path: Vec<u8>, flags: i32 },
    FileRead { handle: u32, max_len: i64 },
    FileWrite { handle: u32 },
    FileLock { handle: u32, mode: u8 },
    FileUnlock { handle: u32 },
    FileSeek { handle: u32, offset: i64, whence: u8 },
    FileStat { handle: u32 },
    FileFlush { handle: u32 },
    FileTruncate { handle: u32, size: i64 },
    FileClose { handle: u32 },
    DirOpen { path: Vec<u8> },
    DirRead { handle: u32, max_entries: u16 },
    DirClose { handle: u32 },
    Mkdir { path: Vec<u8>, mode: u16, recursive: bool },
    Rmdir { path: Vec<u8>, recursive: bool },
    Rename { from: Vec<u8>, to: Vec<u8> },
    Stat { path: Vec<u8> },
    Lstat { path: Vec<u8> },
}

impl Request {
    /// Reads the header fields that follow `op`. Returns `None` for opcodes
    /// that carry no request of their own (AUTH, CLOSE).
    pub async fn decode<R: AsyncRead + Unpin>(
        op: Opcode,
        reader: &mut WireReader<R>,
    ) -> Result<Option<Request>, CodecError> {
        let request = match op {
            Opcode::Auth | Opcode::Close => return Ok(None),
            Opcode::FileOpen => Request::FileOpen {
                path: reader.read_bytes().await?,
                flags: reader.read_i32().await?,
            },
            Opcode::FileRead => Request::FileRead {
                handle: reader.read_u32().await?,
                max_len: reader.read_i64().await?,
            },
            Opcode::FileWrite => Request::FileWrite {
                handle: reader.read_u32().await?,
            },
            Opcode::FileLock => Request::FileLock {
                handle: reader.read_u32().await?,
                mode: reader.read_u8().await?,
            },
            Opcode::FileUnlock => Request::FileUnlock {
                handle: reader.read_u32().await?,
            },
            Opcode::FileSeek => Request::FileSeek {
                handle: reader.read_u32().await?,
                offset: reader.read_i64().await?,
                whence: reader.read_u8().await?,
            },
            Opcode::FileStat => Request::FileStat {
                handle: reader.read_u32().await?,
            },
            Opcode::FileFlush => Request::FileFlush {
                handle: reader.read_u32().await?,
            },
            Opcode::FileTruncate => Request::FileTruncate {
                handle: reader.read_u32().await?,
                size: reader.read_i64().await?,
            },
            Opcode::FileClose => Request::FileClose {
                handle: reader.read_u32().await?,
            },
            Opcode::DirOpen => Request::DirOpen {
                path: reader.read_bytes().await?,
            },
            Opcode::DirRead => Request::DirRead {
                handle: reader.read_u32().await?,
                max_entries: reader.read_u16().await?,
            },
            Opcode::DirClose => Request::DirClose {
                handle: reader.read_u32().await?,
            },
            Opcode::Mkdir => Request::Mkdir {
                path: reader.read_bytes().await?,
                mode: reader.read_u16().await?,
                recursive: reader.read_u8().await? != 0,
            },
            Opcode::Rmdir => Request::Rmdir {
                path: reader.read_bytes().await?,
                recursive: reader.read_u8().await? != 0,
            },
            Opcode::Rename => Request::Rename {
                from: reader.read_bytes().await?,
                to: reader.read_bytes().await?,
            },
            Opcode::Stat => Request::Stat {
                path: reader.read_bytes().await?,
            },
            Opcode::Lstat => Request::Lstat {
                path: reader.read_bytes().await?,
            },
        };
        Ok(Some(request))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::FileOpen { .. } => "FILE_OPEN",
            Request::FileRead { .. } => "FILE_READ",
            Request::FileWrite { .. } => "FILE_WRITE",
            Request::FileLock { .. } => "FILE_LOCK",
            Request::FileUnlock { .. } => "FILE_UNLOCK",
            Request::FileSeek { .. } => "FILE_SEEK",
            Request::FileStat { .. } => "FILE_STAT",
            Request::FileFlush { .. } => "FILE_FLUSH",
            Request::FileTruncate { .. } => "FILE_TRUNCATE",
            Request::FileClose { .. } => "FILE_CLOSE",
            Request::DirOpen { .. } => "DIR_OPEN",
            Request::DirRead { .. } => "DIR_READ",
            Request::DirClose { .. } => "DIR_CLOSE",
            Request::Mkdir { .. } => "MKDIR",
            Request::Rmdir { .. } => "RMDIR",
            Request::Rename { .. } => "RENAME",
            Request::Stat { .. } => "STAT",
            Request::Lstat { .. } => "LSTAT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::WireWriter;

    #[tokio::test]
    async fn test_decode_open_reads_all_fields() {
        let mut writer = WireWriter::new(Vec::new());
        writer.write_string("/a/b.txt").await.unwrap();
        writer.write_i32(0xc1).await.unwrap();
        writer.write_u8(99).await.unwrap();
        let bytes = writer.into_inner();

        let mut reader = WireReader::new(&bytes[..]);
        let request = Request::decode(Opcode::FileOpen, &mut reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            request,
            Request::FileOpen {
                path: b"/a/b.txt".to_vec(),
                flags: 0xc1
            }
        );
        assert_eq!(reader.read_u8().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_decode_mkdir() {
        let mut writer = WireWriter::new(Vec::new());
        writer.write_string("/d").await.unwrap();
        writer.write_u16(0o755).await.unwrap();
        writer.write_u8(1).await.unwrap();
        let bytes = writer.into_inner();

        let mut reader = WireReader::new(&bytes[..]);
        let request = Request::decode(Opcode::Mkdir, &mut reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            request,
            Request::Mkdir {
                path: b"/d".to_vec(),
                mode: 0o755,
                recursive: true
            }
        );
        assert_eq!(request.name(), "MKDIR");
    }

    #[tokio::test]
    async fn test_close_has_no_body() {
        let bytes: [u8; 0] = [];
        let mut reader = WireReader::new(&bytes[..]);
        assert!(
            Request::decode(Opcode::Close, &mut reader)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let bytes = [0u8, 0, 0];
        let mut reader = WireReader::new(&bytes[..]);
        assert!(Request::decode(Opcode::FileSeek, &mut reader).await.is_err());
    }
}

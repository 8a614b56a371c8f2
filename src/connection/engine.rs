//! Connection engine
//!
//! Drives one upgraded connection through `Upgrading → Authenticating →
//! Serving → Closed`. The HTTP layer answers the upgrade request and hands
//! the raw stream over together with the token it disclosed. Requests are
//! handled strictly one at a time; a non-fatal error becomes a failure
//! response and the loop continues, a fatal one ends the connection.

use log::{debug, error, info, warn};
use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::time::timeout;

use crate::config::WIRE_STRING_LIMIT;
use crate::connection::handles::{Handle, HandleTable};
use crate::error::handlers::log_protocol_error;
use crate::error::{AuthError, CodecError, ProtocolError, StorageError};
use crate::protocol::codec::decode_text;
use crate::protocol::codes::{STATUS_FAIL, STATUS_OK};
use crate::protocol::{ChunkError, LockMode, Opcode, Request, Whence, WireReader, WireWriter};
use crate::server::ServerContext;
use crate::storage::{FileStat, OpenFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Upgrading,
    Authenticating,
    Serving,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Upgrading => "upgrading",
            Phase::Authenticating => "authenticating",
            Phase::Serving => "serving",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Runs the stream protocol on an upgraded transport. `token` is the value
/// disclosed in the 101 response, if any; the client must prove it first.
/// Returns once the connection is closed.
pub async fn run<S>(stream: S, peer: &str, ctx: Arc<ServerContext>, token: Option<String>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut conn = Connection::new(
        BufReader::new(read_half),
        BufWriter::new(write_half),
        peer,
        ctx,
    );
    if let Err(err) = conn.drive(token.as_deref()).await {
        log_protocol_error(&err, peer);
    }
    conn.shutdown().await;
}

/// Bounds a fallible step by `limit`; expiry is fatal.
async fn within<T, E>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, ProtocolError>
where
    E: Into<ProtocolError>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ProtocolError::fatal(format!("deadline expired while {what}"))),
    }
}

pub struct Connection<R, W> {
    reader: WireReader<R>,
    writer: WireWriter<W>,
    peer: String,
    ctx: Arc<ServerContext>,
    handles: HandleTable,
    phase: Phase,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, peer: &str, ctx: Arc<ServerContext>) -> Self {
        Self {
            reader: WireReader::new(reader),
            writer: WireWriter::new(writer),
            peer: peer.to_string(),
            ctx,
            handles: HandleTable::new(),
            phase: Phase::Upgrading,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{} {} -> {}", self.peer, self.phase, phase);
        self.phase = phase;
    }

    async fn drive(&mut self, token: Option<&str>) -> Result<(), ProtocolError> {
        info!("Upgraded {}", self.peer);
        if let Some(token) = token {
            self.enter(Phase::Authenticating);
            self.authenticate(token).await?;
        }
        self.enter(Phase::Serving);
        self.serve().await
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), ProtocolError> {
        let ctx = Arc::clone(&self.ctx);
        let Some(authenticator) = ctx.authenticator() else {
            return Ok(());
        };
        let deadline = ctx.config().action_timeout();

        let credential = within(deadline, "authenticating", async {
            let code = self.reader.read_u16().await?;
            if code != u16::from(Opcode::Auth) {
                return Err(ProtocolError::from(AuthError::WrongOpcode(code)));
            }
            let credential = self.reader.read_string(WIRE_STRING_LIMIT).await?;
            Ok::<_, ProtocolError>(credential)
        })
        .await?;

        authenticator.verify(token, &credential)?;

        within(deadline, "acknowledging AUTH", async {
            self.writer.write_u8(STATUS_OK).await?;
            self.writer.flush().await
        })
        .await?;
        info!("Authenticated {}", self.peer);
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), ProtocolError> {
        let idle = self.ctx.config().idle_timeout();
        let action = self.ctx.config().action_timeout();

        loop {
            let code = match timeout(idle, self.reader.read_u16()).await {
                Err(_) => return Err(ProtocolError::fatal("idle deadline expired")),
                Ok(Err(CodecError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("{} went away without CLOSE", self.peer);
                    return Ok(());
                }
                Ok(result) => result?,
            };

            let op = Opcode::try_from(code)
                .map_err(|code| ProtocolError::fatal(format!("unknown opcode {code}")))?;
            match op {
                Opcode::Close => {
                    info!("{} sent CLOSE", self.peer);
                    return Ok(());
                }
                Opcode::Auth => return Err(ProtocolError::fatal("AUTH outside handshake")),
                _ => {}
            }

            let request = within(action, "reading request header", Request::decode(op, &mut self.reader))
                .await?
                .ok_or_else(|| ProtocolError::fatal(format!("opcode {code} carries no request")))?;
            debug!("{} {}", self.peer, request.name());

            match self.execute(request).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log_protocol_error(&err, &self.peer);
                    within(action, "sending failure", self.write_failure(&err)).await?;
                }
            }

            within(action, "flushing response", self.writer.flush()).await?;
        }
    }

    /// Handles one request and writes its success response. A returned
    /// non-fatal error means nothing has been written yet.
    async fn execute(&mut self, request: Request) -> Result<(), ProtocolError> {
        match request {
            Request::FileOpen { path, flags } => {
                let path = self.text(path)?;
                let file = self
                    .ctx
                    .fs()
                    .open_file(&path, OpenFlags::from_wire(flags))
                    .await?;
                let id = self.handles.insert(Handle::File(file))?;
                debug!("{} opened {} as {}", self.peer, path, id);
                self.ok().await?;
                self.writer.write_u32(id).await?;
            }
            Request::FileRead { handle, max_len } => self.file_read(handle, max_len).await?,
            Request::FileWrite { handle } => self.file_write(handle).await?,
            Request::FileLock { handle, mode } => self.file_lock(handle, mode).await?,
            Request::FileUnlock { handle } => {
                let file = self.handles.file_mut(handle)?;
                if !file.has_lock() {
                    return Err(ProtocolError::warning(format!("handle {handle} holds no lock")));
                }
                file.release_lock();
                self.ok().await?;
            }
            Request::FileSeek {
                handle,
                offset,
                whence,
            } => {
                let whence = Whence::try_from(whence)
                    .map_err(|raw| ProtocolError::warning(format!("bad seek whence {raw}")))?;
                let pos = match whence {
                    Whence::Set => SeekFrom::Start(u64::try_from(offset).map_err(|_| {
                        ProtocolError::warning(format!("negative seek offset {offset}"))
                    })?),
                    Whence::Cur => SeekFrom::Current(offset),
                    Whence::End => SeekFrom::End(offset),
                };
                let at = self.handles.file_mut(handle)?.seek(pos).await?;
                self.ok().await?;
                self.writer.write_i64(i64::try_from(at).unwrap_or(i64::MAX)).await?;
            }
            Request::FileStat { handle } => {
                let stat = self.handles.file_mut(handle)?.stat().await?;
                self.write_stat(stat).await?;
            }
            Request::FileFlush { handle } => {
                self.handles.file_mut(handle)?.sync().await?;
                self.ok().await?;
            }
            Request::FileTruncate { handle, size } => {
                let size = u64::try_from(size)
                    .map_err(|_| ProtocolError::notice(format!("negative truncate size {size}")))?;
                self.handles.file_mut(handle)?.truncate(size).await?;
                self.ok().await?;
            }
            Request::FileClose { handle } => {
                self.handles.take_file(handle)?.close().await?;
                self.ok().await?;
            }
            Request::DirOpen { path } => {
                let path = self.text(path)?;
                let dir = self.ctx.fs().open_dir(&path).await?;
                let id = self.handles.insert(Handle::Dir(dir))?;
                self.ok().await?;
                self.writer.write_u32(id).await?;
            }
            Request::DirRead {
                handle,
                max_entries,
            } => {
                let cap = self.ctx.config().max_dir_entries;
                if max_entries > cap {
                    return Err(ProtocolError::notice(format!(
                        "directory read of {max_entries} entries exceeds {cap}"
                    )));
                }
                let names = self
                    .handles
                    .dir_mut(handle)?
                    .read_names(usize::from(max_entries))
                    .await?;
                // status, count, then a length-prefixed name per entry
                let estimate = 3 + names.iter().map(|name| 2 + name.len() as u64).sum::<u64>();
                let limit = self.ctx.pace().deadline_for(estimate);
                within(limit, "sending directory entries", async {
                    self.ok().await?;
                    self.writer.write_u16(names.len() as u16).await?;
                    for name in &names {
                        self.writer.write_string(name).await?;
                    }
                    self.writer.flush().await
                })
                .await?;
            }
            Request::DirClose { handle } => {
                self.handles.take_dir(handle)?;
                self.ok().await?;
            }
            Request::Mkdir {
                path,
                mode,
                recursive,
            } => {
                let path = self.text(path)?;
                let fs = self.ctx.fs();
                if recursive {
                    fs.mkdir_all(&path, u32::from(mode)).await?;
                } else {
                    fs.mkdir(&path, u32::from(mode)).await?;
                }
                self.ok().await?;
            }
            Request::Rmdir { path, recursive } => {
                let path = self.text(path)?;
                let fs = self.ctx.fs();
                if recursive {
                    fs.remove_all(&path).await?;
                } else {
                    fs.remove(&path).await?;
                }
                self.ok().await?;
            }
            Request::Rename { from, to } => {
                let from = self.text(from)?;
                let to = self.text(to)?;
                self.ctx.fs().rename(&from, &to).await?;
                self.ok().await?;
            }
            Request::Stat { path } => {
                let path = self.text(path)?;
                let stat = self.ctx.fs().stat(&path).await?;
                self.write_stat(stat).await?;
            }
            Request::Lstat { path } => {
                let path = self.text(path)?;
                let stat = self.ctx.fs().lstat(&path).await?;
                self.write_stat(stat).await?;
            }
        }
        Ok(())
    }

    async fn file_read(&mut self, handle: u32, max_len: i64) -> Result<(), ProtocolError> {
        let max_len = u64::try_from(max_len)
            .map_err(|_| ProtocolError::notice(format!("negative read length {max_len}")))?;
        let pace = self.ctx.pace();

        let file = self.handles.file_mut(handle)?;
        let size = file.stat().await?.size.max(0) as u64;
        let logical = file.logical().to_string();

        self.writer.write_u8(STATUS_OK).await?;
        let mut limited = file.file().take(max_len);
        let streamed = timeout(
            pace.deadline_for(max_len.min(size)),
            self.writer.write_chunked_from(&mut limited),
        )
        .await
        .map_err(|_| ProtocolError::fatal("deadline expired while streaming file data"))?;

        match streamed {
            Ok(n) => {
                debug!("{} read {} bytes from {}", self.peer, n, logical);
                self.writer.write_u8(STATUS_OK).await?;
            }
            Err(ChunkError::Peer(e)) => return Err(e.into()),
            Err(ChunkError::Local(e)) => {
                let err = ProtocolError::warning(format!("reading {logical}: {e}"));
                log_protocol_error(&err, &self.peer);
                self.write_failure(&err).await?;
            }
        }
        Ok(())
    }

    async fn file_write(&mut self, handle: u32) -> Result<(), ProtocolError> {
        let pace = self.ctx.pace();

        let file = match self.handles.file_mut(handle) {
            Ok(file) => file,
            Err(err) => {
                // The chunk stream follows regardless; skip it to stay in sync.
                if let Err(ChunkError::Peer(e)) = self
                    .reader
                    .read_chunked_into(&mut tokio::io::sink(), &pace)
                    .await
                {
                    return Err(e.into());
                }
                return Err(err);
            }
        };

        let result = self.reader.read_chunked_into(file.file(), &pace).await;
        if result.is_err() && file.created() {
            file.mark_ghost();
        }

        match result {
            Ok(n) => {
                debug!("{} wrote {} bytes to {}", self.peer, n, file.logical());
                self.ok().await?;
                Ok(())
            }
            Err(ChunkError::Peer(e)) => Err(e.into()),
            Err(ChunkError::Local(e)) => {
                if file.is_ghost() {
                    debug!("{} will be removed on close", file.logical());
                }
                Err(ProtocolError::warning(format!("writing {}: {}", file.logical(), e)))
            }
        }
    }

    async fn file_lock(&mut self, handle: u32, mode: u8) -> Result<(), ProtocolError> {
        let mode = LockMode::try_from(mode)
            .map_err(|raw| ProtocolError::warning(format!("bad lock mode {raw}")))?;

        let file = self.handles.file_mut(handle)?;
        // Re-locking converts: the old lock must go before the new one is awaited.
        file.release_lock();
        let logical = file.logical().to_string();

        let fs = self.ctx.fs();
        let acquire = async {
            match mode {
                LockMode::Shared => fs.rlock(&logical).await,
                LockMode::Exclusive => fs.lock(&logical).await,
            }
        };
        let guard = match timeout(self.ctx.config().action_timeout(), acquire).await {
            Ok(guard) => guard?,
            Err(_) => return Err(ProtocolError::warning(format!("lock busy: {logical}"))),
        };

        self.handles.file_mut(handle)?.hold_lock(guard);
        self.ok().await?;
        Ok(())
    }

    fn text(&self, bytes: Vec<u8>) -> Result<String, ProtocolError> {
        decode_text(bytes, self.ctx.config().max_string_length)
            .map_err(|e| ProtocolError::notice(e.to_string()))
    }

    async fn ok(&mut self) -> Result<(), CodecError> {
        self.writer.write_u8(STATUS_OK).await
    }

    async fn write_failure(&mut self, err: &ProtocolError) -> Result<(), CodecError> {
        self.writer.write_u8(STATUS_FAIL).await?;
        self.writer.write_string(&err.to_string()).await
    }

    async fn write_stat(&mut self, stat: FileStat) -> Result<(), CodecError> {
        self.ok().await?;
        self.writer.write_u8(u8::from(stat.is_dir)).await?;
        self.writer.write_i64(stat.size).await?;
        self.writer.write_i64(stat.modified).await
    }

    /// Closes every handle still open, then the transport. Failures are
    /// logged and otherwise ignored.
    pub async fn shutdown(&mut self) {
        self.enter(Phase::Closed);

        for (id, handle) in self.handles.drain() {
            let Handle::File(file) = handle else {
                continue;
            };
            let logical = file.logical().to_string();
            match file.close().await {
                Ok(()) => debug!("{} closed handle {} ({})", self.peer, id, logical),
                Err(e @ StorageError::RollbackFailed { .. }) => {
                    error!("{} closing handle {}: {}", self.peer, id, e)
                }
                Err(e) => warn!("{} closing handle {}: {}", self.peer, id, e),
            }
        }

        let action = self.ctx.config().action_timeout();
        let writer = self.writer.get_mut();
        match timeout(action, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{} shutdown: {}", self.peer, e),
            Err(_) => debug!("{} shutdown timed out", self.peer),
        }
        info!("Closed connection {}", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::Severity;

    fn context(root: &std::path::Path) -> Arc<ServerContext> {
        let config = ServerConfig {
            root_dir: root.display().to_string(),
            ..ServerConfig::default()
        };
        Arc::new(ServerContext::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_within_maps_expiry_to_fatal() {
        let err = within(
            Duration::from_millis(10),
            "waiting",
            std::future::pending::<Result<(), CodecError>>(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.severity, Severity::Fatal);
        assert!(err.message.contains("waiting"));
    }

    #[tokio::test]
    async fn test_close_without_secret() {
        let dir = tempfile::tempdir().unwrap();
        let input = u16::from(Opcode::Close).to_be_bytes();
        let mut out = Vec::new();

        let mut conn = Connection::new(&input[..], &mut out, "test", context(dir.path()));
        assert_eq!(conn.phase(), Phase::Upgrading);
        conn.drive(None).await.unwrap();
        assert_eq!(conn.phase(), Phase::Serving);
        conn.shutdown().await;
        assert_eq!(conn.phase(), Phase::Closed);
        drop(conn);

        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_opcode_during_handshake_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            root_dir: dir.path().display().to_string(),
            secret: Some("s".into()),
            ..ServerConfig::default()
        };
        let ctx = Arc::new(ServerContext::new(config).unwrap());
        let input = u16::from(Opcode::Close).to_be_bytes();
        let mut out = Vec::new();

        let mut conn = Connection::new(&input[..], &mut out, "test", ctx);
        let err = conn.drive(Some("token")).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(conn.phase(), Phase::Authenticating);
        drop(conn);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_stat_of_missing_path_is_warning_response() {
        let dir = tempfile::tempdir().unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&u16::from(Opcode::Stat).to_be_bytes());
        input.extend_from_slice(&[0, 5]);
        input.extend_from_slice(b"/nope");
        input.extend_from_slice(&u16::from(Opcode::Close).to_be_bytes());

        let mut out = Vec::new();
        let mut conn = Connection::new(&input[..], &mut out, "test", context(dir.path()));
        conn.drive(None).await.unwrap();
        drop(conn);

        assert_eq!(out[0], STATUS_FAIL);
        let len = u16::from_be_bytes([out[1], out[2]]) as usize;
        let message = std::str::from_utf8(&out[3..3 + len]).unwrap();
        assert!(message.starts_with("[Warning]"));
    }
}

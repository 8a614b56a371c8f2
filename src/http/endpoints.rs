//! Simple file endpoints
//!
//! GET/HEAD/PUT/DELETE on a single file by logical path. Paths arrive
//! percent-decoded from the router and go through the jail like any other.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use log::{debug, info, warn};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::{HttpError, StorageError};
use crate::http::{Peer, ReplyDeadline};
use crate::protocol::codes::{AUTH_HEADER, PROTOCOL_VERSION, VERSION_HEADER};
use crate::server::ServerContext;
use crate::storage::{OpenFlags, PathLockGuard, jail};

const PARENT_DIR_MODE: u32 = 0o755;

/// The root is a directory and never served.
pub async fn root() -> HttpError {
    HttpError::IsDirectory("/".to_string())
}

/// Serves a file with range and conditional support. The shared path lock
/// stays with the response body until it is dropped.
pub async fn get_file(
    State(ctx): State<Arc<ServerContext>>,
    Extension(Peer(peer)): Extension<Peer>,
    Extension(deadline): Extension<ReplyDeadline>,
    Path(path): Path<String>,
    req: Request,
) -> Result<Response, HttpError> {
    let logical = format!("/{path}");
    let fs = ctx.fs();
    let guard = bounded_lock(&ctx, &logical, fs.rlock(&logical)).await?;

    let stat = fs.stat(&logical).await?;
    if stat.is_dir {
        return Err(HttpError::IsDirectory(logical));
    }
    let resolved = fs.resolve(&logical)?;

    let response = match ServeFile::new(resolved).oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    debug!("Serving {} to {} as {}", logical, peer, response.status());

    // The body may not outlive the transfer deadline, and the lock goes with it.
    deadline.allow(ctx.pace().deadline_for(stat.size.max(0) as u64));
    Ok(response.map(|body| {
        Body::new(body.map_frame(move |frame| {
            let _held = &guard;
            frame
        }))
    }))
}

pub async fn put_file(
    State(ctx): State<Arc<ServerContext>>,
    Extension(Peer(peer)): Extension<Peer>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, HttpError> {
    let logical = format!("/{path}");
    check_mutation(&ctx, &headers, &logical, &peer)?;
    let len = content_length(&headers).ok_or(HttpError::LengthRequired)?;

    store(&ctx, &logical, body, len).await?;
    info!("Stored {} ({} bytes) for {}", logical, len, peer);
    Ok((StatusCode::CREATED, format!("stored {logical} ({len} bytes)")).into_response())
}

pub async fn delete_file(
    State(ctx): State<Arc<ServerContext>>,
    Extension(Peer(peer)): Extension<Peer>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let logical = format!("/{path}");
    check_mutation(&ctx, &headers, &logical, &peer)?;

    let fs = ctx.fs();
    let _guard = bounded_lock(&ctx, &logical, fs.lock(&logical)).await?;
    fs.remove(&logical).await?;
    info!("Deleted {} for {}", logical, peer);
    Ok((StatusCode::OK, format!("deleted {logical}")).into_response())
}

/// Writes the body to a new file, rolling it back if the body is short,
/// fails, or misses its deadline.
async fn store(ctx: &ServerContext, logical: &str, body: Body, len: u64) -> Result<(), HttpError> {
    let fs = ctx.fs();
    let path = jail::clean(logical)?;
    if let Some((parent, _)) = path.rsplit_once('/') {
        if !parent.is_empty() {
            fs.mkdir_all(parent, PARENT_DIR_MODE).await?;
        }
    }

    let _guard = bounded_lock(ctx, &path, fs.lock(&path)).await?;
    let mut file = fs
        .open_file(&path, OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::EXCL)
        .await?;

    let received = match timeout(ctx.pace().deadline_for(len), copy_body(body, file.file())).await {
        Ok(Ok(n)) if n == len => Ok(()),
        Ok(Ok(n)) => Err(format!("got {n} of {len} bytes")),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("deadline expired".to_string()),
    };
    if let Err(reason) = &received {
        warn!("Rolling back {}: {}", path, reason);
        file.mark_ghost();
    }

    file.close().await?;
    received.map_err(|reason| HttpError::IncompleteBody { path, reason })
}

async fn copy_body(mut body: Body, file: &mut File) -> io::Result<u64> {
    let mut written = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(io::Error::other)?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
    }
    file.flush().await?;
    Ok(written)
}

/// Path lock wait bounded by the action deadline.
async fn bounded_lock(
    ctx: &ServerContext,
    logical: &str,
    acquire: impl Future<Output = Result<PathLockGuard, StorageError>>,
) -> Result<PathLockGuard, HttpError> {
    match timeout(ctx.config().action_timeout(), acquire).await {
        Ok(guard) => Ok(guard?),
        Err(_) => Err(HttpError::LockBusy(logical.to_string())),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Version and proof checks shared by mutating methods.
fn check_mutation(
    ctx: &ServerContext,
    headers: &HeaderMap,
    logical: &str,
    peer: &str,
) -> Result<(), HttpError> {
    let checked = authorize(ctx, headers, logical);
    if let Err(e) = &checked {
        warn!("Rejected change to {} from {}: {}", logical, peer, e);
    }
    checked
}

fn authorize(ctx: &ServerContext, headers: &HeaderMap, logical: &str) -> Result<(), HttpError> {
    if header_str(headers, VERSION_HEADER) != Some(PROTOCOL_VERSION) {
        return Err(HttpError::VersionRequired);
    }
    let Some(authenticator) = ctx.authenticator() else {
        return Ok(());
    };
    let credential = header_str(headers, AUTH_HEADER).unwrap_or_default();
    authenticator.verify(logical, credential)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::http::HeaderValue;

    fn context(root: &std::path::Path, secret: Option<&str>) -> ServerContext {
        let config = ServerConfig {
            root_dir: root.display().to_string(),
            secret: secret.map(String::from),
            ..ServerConfig::default()
        };
        ServerContext::new(config).unwrap()
    }

    #[test]
    fn test_content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_mutation_requires_version_then_proof() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Some("s"));

        let mut headers = HeaderMap::new();
        assert!(matches!(
            authorize(&ctx, &headers, "/f"),
            Err(HttpError::VersionRequired)
        ));

        headers.insert("byfs-version", HeaderValue::from_static("1"));
        assert!(matches!(
            authorize(&ctx, &headers, "/f"),
            Err(HttpError::Auth(_))
        ));

        let credential = ctx.authenticator().unwrap().credential("/f", "salt");
        headers.insert("byfs-auth", HeaderValue::from_str(&credential).unwrap());
        assert!(authorize(&ctx, &headers, "/f").is_ok());
        assert!(authorize(&ctx, &headers, "/g").is_err());
    }

    #[tokio::test]
    async fn test_lock_wait_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            root_dir: dir.path().display().to_string(),
            action_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(config).unwrap();
        let fs = ctx.fs();

        let _held = fs.lock("/busy").await.unwrap();
        let err = bounded_lock(&ctx, "/busy", fs.rlock("/busy")).await.unwrap_err();
        assert!(matches!(err, HttpError::LockBusy(_)));
    }
}

//! Shared per-server state handed to every connection.

use std::sync::Arc;

use crate::auth::TokenAuthenticator;
use crate::config::ServerConfig;
use crate::error::StorageError;
use crate::protocol::TransferPace;
use crate::storage::Filesystem;

/// Everything a connection needs, built once at startup.
pub struct ServerContext {
    config: Arc<ServerConfig>,
    fs: Arc<Filesystem>,
    authenticator: Option<Arc<TokenAuthenticator>>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Result<Self, StorageError> {
        let fs = Filesystem::new(config.root_path(), config.file_mode)?;
        let authenticator = config
            .secret()
            .map(|secret| Arc::new(TokenAuthenticator::new(secret, config.digest)));

        Ok(Self {
            config: Arc::new(config),
            fs: Arc::new(fs),
            authenticator,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn fs(&self) -> &Filesystem {
        &self.fs
    }

    /// `None` when no shared secret is configured.
    pub fn authenticator(&self) -> Option<&TokenAuthenticator> {
        self.authenticator.as_deref()
    }

    pub fn pace(&self) -> TransferPace {
        TransferPace::new(self.config.action_timeout(), self.config.min_transfer_kbps)
    }
}

//! Transport-client cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use quarry_core::config::RunnerConfig;

use crate::transport::{TransportClient, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    url: String,
    token: String,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
}

/// One `TransportClient` per (url, token, CA file, cert file) tuple, so
/// every runner with the same credentials shares a connection pool and
/// last-update marker.
#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<HashMap<ClientKey, Arc<TransportClient>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_for(&self, config: &RunnerConfig) -> Result<Arc<TransportClient>, TransportError> {
        let key = ClientKey {
            url: config.url.clone(),
            token: config.token.clone(),
            ca_file: config.tls_ca_file.clone(),
            cert_file: config.tls_cert_file.clone(),
        };

        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(TransportClient::new(config)?);
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }
}

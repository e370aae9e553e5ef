use std::sync::Arc;

use tracing::{error, info};

use crate::acceptor::TcpAcceptor;
use crate::ca::{ImpersonationCache, RootAuthority};
use crate::client::Client;
use crate::error::ProxyError;
use crate::session::Session;

/// Composes the acceptor, the impersonation cache and the injected upstream
/// client: constructs one [`Session`] per accepted connection.
pub struct ProxyService {
    acceptor: TcpAcceptor,
    cache: Arc<ImpersonationCache>,
    client: Option<Arc<dyn Client>>,
}

impl ProxyService {
    pub async fn bind(addr: &str, authority: RootAuthority) -> Result<Self, ProxyError> {
        let acceptor = TcpAcceptor::bind(addr).await?;
        let cache = ImpersonationCache::new(authority)
            .map_err(|e| ProxyError::InvalidAuthority(e.to_string()))?;
        Ok(ProxyService {
            acceptor,
            cache: Arc::new(cache),
            client: None,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn root_certificate_der(&self) -> &rustls::pki_types::CertificateDer<'static> {
        self.cache.authority().certificate_der()
    }

    pub fn set_client(&mut self, client: Arc<dyn Client>) {
        self.client = Some(client);
    }

    /// Serves connections until the acceptor is closed or hits a fatal
    /// error. Requires `set_client` to have been called first.
    pub async fn listen(&self) -> Result<(), ProxyError> {
        let client = self.client.clone().ok_or(ProxyError::MissingClient)?;
        let cache = self.cache.clone();

        self.acceptor
            .serve(move |stream, addr| {
                let cache = cache.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let session = Session::new(addr, cache, client);
                    if let Err(e) = session.run(stream).await {
                        error!(peer = %addr, error = %e, "session ended with error");
                    } else {
                        info!(peer = %addr, "session closed");
                    }
                });
            })
            .await
    }

    pub fn close(&self) {
        self.acceptor.close();
    }
}

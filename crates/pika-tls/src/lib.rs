use std::sync::{Arc, Once, OnceLock};

static INIT: Once = Once::new();
static CLIENT_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

/// rustls 0.23 selects a process-level CryptoProvider; pick ring up front so
/// a second provider elsewhere in the graph cannot make the choice ambiguous.
pub fn init_rustls_crypto_provider() {
    INIT.call_once(|| {
        // Already installed by the embedding app is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Root store for relay TLS.
///
/// Native roots first; mobile targets usually report none, in which case the
/// bundled Mozilla roots are used.
pub fn root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!(%err, "skipping native cert source");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        tracing::debug!(added, ignored, "some native certs could not be parsed");
    }

    if roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}

/// Shared client config for every `wss://` relay connection in the process.
pub fn client_config() -> Arc<rustls::ClientConfig> {
    CLIENT_CONFIG
        .get_or_init(|| {
            init_rustls_crypto_provider();
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store())
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

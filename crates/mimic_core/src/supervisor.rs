use std::net::SocketAddr;
use std::sync::Arc;

use mimic_net::{
    start_egress, BoringImpersonator, CertificateAuthority, ClientCache, InterceptProxy,
    ListenerHandle, TlsImpersonator,
};
use mimic_traits::{MimicError, Result, TransportConfig};
use mod_registry::FingerprintRegistry;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::SettingsStore;

/// Owns the fingerprint registry and both listeners.
///
/// Captures outlive a stop/start cycle; only the listeners are torn down.
pub struct Supervisor {
    registry: Arc<FingerprintRegistry>,
    settings: Arc<SettingsStore>,
    clients: Arc<ClientCache>,
    ca: Arc<CertificateAuthority>,
    intercept: Mutex<Option<ListenerHandle>>,
    egress: Mutex<Option<ListenerHandle>>,
}

impl Supervisor {
    pub fn new(settings: Arc<SettingsStore>, ca: Arc<CertificateAuthority>) -> Self {
        Self::with_impersonator(settings, ca, Arc::new(BoringImpersonator::new()))
    }

    pub fn with_impersonator(
        settings: Arc<SettingsStore>,
        ca: Arc<CertificateAuthority>,
        tls: Arc<dyn TlsImpersonator>,
    ) -> Self {
        let registry = FingerprintRegistry::new();
        let clients = Arc::new(ClientCache::new(registry.lookup_fn(), tls));
        Self {
            registry,
            settings,
            clients,
            ca,
            intercept: Mutex::new(None),
            egress: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<FingerprintRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Starts the intercept listener on `intercept_addr`, forwarding to the inspector at
    /// `inspector_addr`.
    pub async fn start(&self, intercept_addr: &str, inspector_addr: &str) -> Result<SocketAddr> {
        let mut slot = self.intercept.lock().await;
        if let Some(running) = slot.as_ref() {
            return Err(MimicError::Configuration(format!(
                "intercept proxy already running on {}",
                running.local_addr()
            )));
        }

        let timeouts = self.settings.current().timeouts();
        let proxy =
            InterceptProxy::new(inspector_addr, timeouts, self.registry.clone(), self.ca.clone())?;
        let handle = proxy.start(intercept_addr).await?;
        let addr = handle.local_addr();
        *slot = Some(handle);
        Ok(addr)
    }

    pub async fn start_egress(&self, listen_addr: &str) -> Result<SocketAddr> {
        let mut slot = self.egress.lock().await;
        if let Some(running) = slot.as_ref() {
            return Err(MimicError::Configuration(format!(
                "egress listener already running on {}",
                running.local_addr()
            )));
        }

        let handle = start_egress(
            listen_addr,
            self.settings.clone(),
            self.clients.clone(),
            self.ca.clone(),
        )
        .await?;
        let addr = handle.local_addr();
        *slot = Some(handle);
        Ok(addr)
    }

    pub async fn intercept_addr(&self) -> Option<SocketAddr> {
        self.intercept.lock().await.as_ref().map(ListenerHandle::local_addr)
    }

    pub async fn egress_addr(&self) -> Option<SocketAddr> {
        self.egress.lock().await.as_ref().map(ListenerHandle::local_addr)
    }

    /// Stops whichever listeners are running. Safe to call repeatedly.
    pub async fn stop(&self) {
        let intercept = self.intercept.lock().await.take();
        let egress = self.egress.lock().await.take();
        if intercept.is_none() && egress.is_none() {
            return;
        }

        tokio::join!(
            async {
                if let Some(handle) = &intercept {
                    handle.stop().await;
                }
            },
            async {
                if let Some(handle) = &egress {
                    handle.stop().await;
                }
            }
        );
        self.clients.clear();
        info!(captures = self.registry.len(), "proxy stopped");
    }

    /// Replaces the saved transport settings. Cached clients are dropped so the next
    /// request is built from the new document.
    pub fn apply_settings(&self, doc: &str) -> Result<TransportConfig> {
        let config = self.settings.replace(doc)?;
        self.clients.clear();
        info!(
            host = %config.host,
            fingerprint = %config.fingerprint,
            use_intercepted = config.use_intercepted_fingerprint,
            "settings saved"
        );
        Ok(config)
    }

    /// Reloads from the settings file on external edits.
    pub fn watch_settings(&self) -> anyhow::Result<()> {
        let clients = self.clients.clone();
        self.settings.start_watching(move |_| clients.clear())
    }
}

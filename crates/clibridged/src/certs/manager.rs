//! The process-wide certificate manager.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - A poisoned state lock is recovered, never propagated

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rustls::ServerConfig;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::store::{load_pair, CertificateStore};
use super::{CertMode, CertificateConfig, CertificateError, CertificateMaterial, Provenance};

/// Material plus the rustls configuration built from it.
#[derive(Debug)]
pub struct ActiveCertificate {
    pub material: Arc<CertificateMaterial>,
    pub server_config: Arc<ServerConfig>,
}

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    /// Nothing loaded yet
    Uninitialized,
    /// Deposited (external) material is active
    Loaded,
    /// Self-signed material is active
    SelfSigned,
}

/// Result of a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub previous: Option<String>,
    pub current: String,
    pub changed: bool,
}

/// Snapshot of the active certificate for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub state: CertificateState,
    pub fingerprint: String,
    pub provenance: Provenance,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_alt_names: Vec<String>,
    /// External material was expected but self-signed is in use
    pub fallback: bool,
    /// Completed reloads since startup
    pub reloads: u64,
}

#[derive(Debug)]
struct ManagerState {
    state: CertificateState,
    fallback: bool,
    reloads: u64,
}

/// Owns the active certificate and swaps it atomically.
///
/// Shared through `Arc`. Readers call [`subscribe`](Self::subscribe) or
/// [`current`](Self::current) and clone the `Arc` they get; writers replace
/// the whole value.
#[derive(Debug)]
pub struct CertificateManager {
    config: CertificateConfig,
    store: CertificateStore,
    active: watch::Sender<Option<Arc<ActiveCertificate>>>,
    state: Mutex<ManagerState>,
}

impl CertificateManager {
    /// Creates an uninitialized manager. Call [`ensure`](Self::ensure) next.
    #[must_use]
    pub fn new(config: CertificateConfig) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            store: CertificateStore::new(config.self_signed_dir.clone()),
            config,
            active,
            state: Mutex::new(ManagerState {
                state: CertificateState::Uninitialized,
                fallback: false,
                reloads: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CertificateConfig {
        &self.config
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Loads material if none is active yet and returns the active material.
    ///
    /// # Errors
    ///
    /// Only when self-signed material can be neither loaded nor generated.
    pub fn ensure(&self) -> Result<Arc<CertificateMaterial>, CertificateError> {
        if let Some(active) = self.current() {
            return Ok(Arc::clone(&active.material));
        }

        let (material, fallback) = self.resolve()?;
        let active = self.install(material, fallback)?;
        info!(
            fingerprint = %active.material.fingerprint,
            provenance = %active.material.provenance,
            not_after = %active.material.not_after,
            "Certificate loaded"
        );
        Ok(Arc::clone(&active.material))
    }

    /// Recomputes material from the current files and swaps it in.
    ///
    /// # Errors
    ///
    /// Only when self-signed material can be neither loaded nor generated;
    /// the previous material stays active in that case.
    pub fn reload(&self) -> Result<ReloadOutcome, CertificateError> {
        let previous = self.current().map(|a| a.material.fingerprint.clone());
        let (material, fallback) = self.resolve()?;
        let active = self.install(material, fallback)?;

        let current = active.material.fingerprint.clone();
        let changed = previous.as_deref() != Some(current.as_str());
        self.state().reloads += 1;

        info!(
            previous = previous.as_deref().unwrap_or("none"),
            current = %current,
            changed,
            "Certificate reloaded"
        );
        Ok(ReloadOutcome {
            previous,
            current,
            changed,
        })
    }

    /// Backs up the persisted self-signed pair, generates a new one and
    /// reloads.
    ///
    /// External material, when valid, stays preferred after the reload.
    ///
    /// # Errors
    ///
    /// Backup, generation or persistence failures.
    pub fn regenerate(&self) -> Result<ReloadOutcome, CertificateError> {
        self.store.backup()?;
        let material = CertificateMaterial::generate_self_signed(&self.config.required_names())?;
        self.store.save(&material)?;
        info!(fingerprint = %material.fingerprint, "Generated new self-signed certificate");
        self.reload()
    }

    /// Deletes the persisted self-signed pair.
    ///
    /// The active certificate keeps serving until the next reload or
    /// restart, which will generate a new pair.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Io` if a file cannot be removed.
    pub fn revoke(&self) -> Result<bool, CertificateError> {
        let removed = self.store.remove()?;
        if removed {
            warn!(dir = %self.store.dir().display(), "Self-signed certificate revoked");
        }
        Ok(removed)
    }

    /// Snapshot of the active certificate, `None` before `ensure`.
    pub fn info(&self) -> Option<CertificateInfo> {
        let active = self.current()?;
        let state = self.state();
        Some(CertificateInfo {
            state: state.state,
            fingerprint: active.material.fingerprint.clone(),
            provenance: active.material.provenance,
            not_before: active.material.not_before,
            not_after: active.material.not_after,
            subject_alt_names: active.material.subject_alt_names.clone(),
            fallback: state.fallback,
            reloads: state.reloads,
        })
    }

    /// The active certificate, if any.
    pub fn current(&self) -> Option<Arc<ActiveCertificate>> {
        self.active.borrow().clone()
    }

    /// Receiver that changes whenever material is swapped.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ActiveCertificate>>> {
        self.active.subscribe()
    }

    /// Picks material for the configured mode.
    ///
    /// Returns the material and whether it is a fallback.
    fn resolve(&self) -> Result<(CertificateMaterial, bool), CertificateError> {
        let mut fallback = false;

        if self.config.mode != CertMode::SelfSigned {
            let cert_path = &self.config.external_cert_path;
            let key_path = &self.config.external_key_path;
            let present = cert_path.is_file() && key_path.is_file();

            if present {
                match load_pair(cert_path, key_path, Provenance::External) {
                    Ok(material) => return Ok((material, false)),
                    Err(e) => {
                        warn!(
                            cert = %cert_path.display(),
                            error = %e,
                            "External certificate unusable, falling back to self-signed"
                        );
                        fallback = true;
                    }
                }
            } else if self.config.mode == CertMode::External {
                warn!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "External certificate not found, falling back to self-signed"
                );
                fallback = true;
            }
        }

        Ok((self.self_signed()?, fallback))
    }

    /// Reuses the persisted self-signed pair or generates a new one.
    fn self_signed(&self) -> Result<CertificateMaterial, CertificateError> {
        let required = self.config.required_names();

        match self.store.load() {
            Ok(Some(material)) if material.covers(&required) => {
                debug!(fingerprint = %material.fingerprint, "Reusing persisted self-signed certificate");
                return Ok(material);
            }
            Ok(Some(material)) => {
                info!(
                    have = ?material.subject_alt_names,
                    want = ?required,
                    "Persisted certificate does not cover configured names, regenerating"
                );
            }
            Ok(None) => debug!("No persisted self-signed certificate"),
            Err(e) => warn!(error = %e, "Persisted self-signed certificate unusable, regenerating"),
        }

        let material = CertificateMaterial::generate_self_signed(&required)?;
        if let Err(e) = self.store.save(&material) {
            // Not fatal: the material is still usable in memory
            warn!(error = %e, "Failed to persist self-signed certificate");
        }
        info!(fingerprint = %material.fingerprint, "Generated self-signed certificate");
        Ok(material)
    }

    fn install(
        &self,
        material: CertificateMaterial,
        fallback: bool,
    ) -> Result<Arc<ActiveCertificate>, CertificateError> {
        let server_config = material.server_config()?;
        let state = match material.provenance {
            Provenance::External => CertificateState::Loaded,
            Provenance::SelfSigned => CertificateState::SelfSigned,
        };

        let active = Arc::new(ActiveCertificate {
            material: Arc::new(material),
            server_config,
        });

        {
            let mut guard = self.state();
            guard.state = state;
            guard.fallback = fallback;
        }
        self.active.send_replace(Some(Arc::clone(&active)));
        Ok(active)
    }
}

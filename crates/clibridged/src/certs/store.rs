//! On-disk persistence of self-signed material.
//!
//! Layout:
//!
//! ```text
//! <dir>/                  0700
//! ├── server.crt          0644
//! ├── server.key          0600
//! └── backup/
//!     ├── server-20250101-120000-000.crt
//!     └── server-20250101-120000-000.key
//! ```

use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{CertificateError, CertificateMaterial, Provenance};

/// Number of backed-up pairs kept by `backup`.
pub const MAX_BACKUPS: usize = 5;

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";
const BACKUP_DIR: &str = "backup";
const BACKUP_PREFIX: &str = "server-";

/// A directory holding one certificate/key pair plus backups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    /// Returns true if both files of the pair exist.
    pub fn exists(&self) -> bool {
        self.cert_path().is_file() && self.key_path().is_file()
    }

    /// Loads and validates the persisted pair.
    ///
    /// Returns `Ok(None)` if no pair is persisted.
    ///
    /// # Errors
    ///
    /// I/O errors reading the files or validation errors from
    /// [`CertificateMaterial::from_pem`].
    pub fn load(&self) -> Result<Option<CertificateMaterial>, CertificateError> {
        if !self.exists() {
            return Ok(None);
        }
        load_pair(&self.cert_path(), &self.key_path(), Provenance::SelfSigned).map(Some)
    }

    /// Writes the pair with restrictive permissions.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Io` if the directory or files cannot be written.
    pub fn save(&self, material: &CertificateMaterial) -> Result<(), CertificateError> {
        create_private_dir(&self.dir)?;
        write_with_mode(&self.cert_path(), material.cert_pem.as_bytes(), 0o644)?;
        write_with_mode(&self.key_path(), material.key_pem.as_bytes(), 0o600)?;
        debug!(dir = %self.dir.display(), fingerprint = %material.fingerprint, "Certificate pair persisted");
        Ok(())
    }

    /// Copies the current pair into `backup/` and prunes old backups.
    ///
    /// Returns the backup certificate path, or `None` if there was nothing
    /// to back up.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Io` if copying fails.
    pub fn backup(&self) -> Result<Option<PathBuf>, CertificateError> {
        if !self.exists() {
            return Ok(None);
        }

        let backup_dir = self.backup_dir();
        create_private_dir(&backup_dir)?;

        let stamp = Utc::now().format("%Y%m%d-%H%M%S-%3f");
        let cert_backup = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}.crt"));
        let key_backup = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}.key"));

        fs::copy(self.cert_path(), &cert_backup).map_err(|e| CertificateError::io(&cert_backup, e))?;
        fs::copy(self.key_path(), &key_backup).map_err(|e| CertificateError::io(&key_backup, e))?;
        fs::set_permissions(&key_backup, Permissions::from_mode(0o600))
            .map_err(|e| CertificateError::io(&key_backup, e))?;

        info!(backup = %cert_backup.display(), "Backed up certificate pair");
        self.prune_backups();
        Ok(Some(cert_backup))
    }

    /// Backed-up certificate files, oldest first.
    pub fn backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.backup_dir()) else {
            return Vec::new();
        };

        let mut certs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "crt")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(BACKUP_PREFIX))
            })
            .collect();
        // Timestamped names sort chronologically
        certs.sort();
        certs
    }

    fn prune_backups(&self) {
        let backups = self.backups();
        let excess = backups.len().saturating_sub(MAX_BACKUPS);

        for cert in backups.iter().take(excess) {
            let key = cert.with_extension("key");
            for path in [cert, &key] {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to prune certificate backup");
                }
            }
        }
    }

    /// Deletes the persisted pair. Backups are kept.
    ///
    /// Returns true if anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::Io` if a file exists but cannot be removed.
    pub fn remove(&self) -> Result<bool, CertificateError> {
        let mut removed = false;
        for path in [self.cert_path(), self.key_path()] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CertificateError::io(&path, e)),
            }
        }
        Ok(removed)
    }
}

/// Reads and validates a certificate/key pair from two files.
///
/// # Errors
///
/// I/O or validation errors.
pub(crate) fn load_pair(
    cert_path: &Path,
    key_path: &Path,
    provenance: Provenance,
) -> Result<CertificateMaterial, CertificateError> {
    let cert_pem = fs::read_to_string(cert_path).map_err(|e| CertificateError::io(cert_path, e))?;
    let key_pem = fs::read_to_string(key_path).map_err(|e| CertificateError::io(key_path, e))?;
    CertificateMaterial::from_pem(&cert_pem, &key_pem, provenance)
}

fn create_private_dir(dir: &Path) -> Result<(), CertificateError> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| CertificateError::io(dir, e))?;
    fs::set_permissions(dir, Permissions::from_mode(0o700)).map_err(|e| CertificateError::io(dir, e))
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|e| CertificateError::io(path, e))?;
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| CertificateError::io(path, e))
}

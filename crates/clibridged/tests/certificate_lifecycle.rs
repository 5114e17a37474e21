//! Certificate lifecycle across modes, restarts and rotations.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::fs;
use std::path::Path;

use clibridged::certs::{
    CertMode, CertificateConfig, CertificateManager, CertificateMaterial, CertificateState,
    Provenance, FINGERPRINT_PREFIX, MAX_BACKUPS,
};

fn config(dir: &Path, mode: CertMode) -> CertificateConfig {
    CertificateConfig {
        mode,
        self_signed_dir: dir.join("self_signed"),
        external_cert_path: dir.join("external/fullchain.pem"),
        external_key_path: dir.join("external/privkey.pem"),
        hostname: "bridge.local".to_string(),
        subject_alt_names: vec!["127.0.0.1".to_string()],
    }
}

fn write_external(dir: &Path, cert_pem: &str, key_pem: &str) {
    let external = dir.join("external");
    fs::create_dir_all(&external).unwrap();
    fs::write(external.join("fullchain.pem"), cert_pem).unwrap();
    fs::write(external.join("privkey.pem"), key_pem).unwrap();
}

fn names() -> Vec<String> {
    vec!["bridge.local".to_string(), "127.0.0.1".to_string()]
}

#[test]
fn test_fingerprint_stable_across_restarts() {
    let tmp = tempfile::tempdir().unwrap();

    let first = CertificateManager::new(config(tmp.path(), CertMode::Auto))
        .ensure()
        .unwrap();
    let second = CertificateManager::new(config(tmp.path(), CertMode::Auto))
        .ensure()
        .unwrap();

    assert!(first.fingerprint.starts_with(FINGERPRINT_PREFIX));
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.provenance, Provenance::SelfSigned);
    assert!(first.covers(&names()));
}

#[test]
fn test_auto_mode_prefers_external_when_it_appears() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(config(tmp.path(), CertMode::Auto));

    let self_signed = manager.ensure().unwrap();
    assert!(!manager.info().unwrap().fallback);

    let external = CertificateMaterial::generate_self_signed(&names()).unwrap();
    write_external(tmp.path(), &external.cert_pem, &external.key_pem);

    let outcome = manager.reload().unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.previous.as_deref(), Some(self_signed.fingerprint.as_str()));
    assert_eq!(outcome.current, external.fingerprint);

    let info = manager.info().unwrap();
    assert_eq!(info.state, CertificateState::Loaded);
    assert_eq!(info.provenance, Provenance::External);

    // Removing the external pair returns to the persisted self-signed one
    fs::remove_dir_all(tmp.path().join("external")).unwrap();
    let outcome = manager.reload().unwrap();
    assert_eq!(outcome.current, self_signed.fingerprint);
    assert_eq!(manager.info().unwrap().reloads, 2);
}

#[test]
fn test_mismatched_external_key_falls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let a = CertificateMaterial::generate_self_signed(&names()).unwrap();
    let b = CertificateMaterial::generate_self_signed(&names()).unwrap();
    write_external(tmp.path(), &a.cert_pem, &b.key_pem);

    let manager = CertificateManager::new(config(tmp.path(), CertMode::External));
    let material = manager.ensure().unwrap();

    assert_eq!(material.provenance, Provenance::SelfSigned);
    assert_ne!(material.fingerprint, a.fingerprint);
    let info = manager.info().unwrap();
    assert!(info.fallback);
    assert_eq!(info.state, CertificateState::SelfSigned);
}

#[test]
fn test_garbage_external_falls_back() {
    let tmp = tempfile::tempdir().unwrap();
    write_external(tmp.path(), "not a certificate", "not a key");

    let manager = CertificateManager::new(config(tmp.path(), CertMode::Auto));
    let material = manager.ensure().unwrap();
    assert_eq!(material.provenance, Provenance::SelfSigned);
    assert!(manager.info().unwrap().fallback);
}

#[test]
fn test_self_signed_mode_ignores_external() {
    let tmp = tempfile::tempdir().unwrap();
    let external = CertificateMaterial::generate_self_signed(&names()).unwrap();
    write_external(tmp.path(), &external.cert_pem, &external.key_pem);

    let manager = CertificateManager::new(config(tmp.path(), CertMode::SelfSigned));
    let material = manager.ensure().unwrap();
    assert_ne!(material.fingerprint, external.fingerprint);
    assert_eq!(material.provenance, Provenance::SelfSigned);
}

#[test]
fn test_regenerate_keeps_bounded_backups() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(config(tmp.path(), CertMode::SelfSigned));
    let mut seen = vec![manager.ensure().unwrap().fingerprint.clone()];

    for _ in 0..MAX_BACKUPS + 2 {
        let outcome = manager.regenerate().unwrap();
        assert!(outcome.changed);
        assert!(!seen.contains(&outcome.current));
        seen.push(outcome.current);
    }

    let backups = manager.store().backups();
    assert!(!backups.is_empty());
    assert!(backups.len() <= MAX_BACKUPS);
    for cert in &backups {
        assert!(cert.with_extension("key").is_file());
    }

    // The newest material is what a restart picks up
    let restarted = CertificateManager::new(config(tmp.path(), CertMode::SelfSigned))
        .ensure()
        .unwrap();
    assert_eq!(Some(&restarted.fingerprint), seen.last());
}

#[test]
fn test_revoke_then_reload_generates_new_pair() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(config(tmp.path(), CertMode::SelfSigned));
    let before = manager.ensure().unwrap();

    assert!(manager.revoke().unwrap());
    assert!(!manager.store().exists());
    // Still serving the revoked material until reload
    assert_eq!(manager.info().unwrap().fingerprint, before.fingerprint);

    let outcome = manager.reload().unwrap();
    assert!(outcome.changed);
    assert!(manager.store().exists());
    assert!(manager.revoke().unwrap());
}

//! Detached-signature verification for DLC bundles.
//!
//! Grounded on `harborgrid-justin-caddy`'s `enterprise::crypto::asymmetric`
//! use of the `rsa` and `sha2` crates, adapted from that module's OAEP
//! encryption API to PKCS#1 v1.5 *signing*, the scheme the original
//! kernel's `tests/test_signature.py` exercises: a SHA-256 digest of
//! the bundle file's bytes, signed with `PKCS1v15`, base64-encoded into
//! a sibling `.sig` file.

use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("failed to read bundle file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid public key PEM: {0}")]
    InvalidPublicKey(String),

    #[error("signature file is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("signature does not verify against any trusted key")]
    VerificationFailed,

    #[error("signature required but no .sig file is present for {0}")]
    MissingSignature(String),
}

pub type Result<T> = std::result::Result<T, SignatureError>;

/// Controls how strictly a bundle's signature is enforced.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignaturePolicy {
    /// Reject any bundle lacking a `.sig` file.
    pub required: bool,
    /// Verify the signature if a `.sig` file happens to be present,
    /// even when `required` is false.
    pub verify_if_present: bool,
}

/// A public key trusted to sign bundles.
pub struct TrustedKey(RsaPublicKey);

/// Load PEM-encoded RSA public keys from files, accepting either
/// PKCS#1 (`RSA PUBLIC KEY`) or SubjectPublicKeyInfo (`PUBLIC KEY`)
/// framing.
pub fn load_public_keys_from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<TrustedKey>> {
    let mut keys = Vec::with_capacity(paths.len());
    for path in paths {
        let pem = std::fs::read_to_string(path)?;
        let key = RsaPublicKey::from_public_key_pem(&pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        keys.push(TrustedKey(key));
    }
    Ok(keys)
}

/// Verify `bundle_path`'s sibling `.sig` file against the digest of its
/// bytes. The bundle must verify against at least one of `trusted_keys`.
///
/// This must run to completion, with a successful outcome, *before*
/// the bundle is ever `dlopen`'d — the kernel's verify-before-load
/// invariant.
pub fn verify_bundle_signature(
    bundle_path: &Path,
    trusted_keys: &[TrustedKey],
    policy: SignaturePolicy,
) -> Result<bool> {
    let sig_path = sibling_sig_path(bundle_path);

    if !sig_path.exists() {
        return if policy.required {
            Err(SignatureError::MissingSignature(
                bundle_path.display().to_string(),
            ))
        } else {
            Ok(false)
        };
    }

    if !policy.required && !policy.verify_if_present {
        return Ok(false);
    }

    let bundle_bytes = std::fs::read(bundle_path)?;
    let sig_b64 = std::fs::read_to_string(&sig_path)?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(sig_b64.trim())
        .map_err(|e| SignatureError::InvalidBase64(e.to_string()))?;

    let digest = Sha256::digest(&bundle_bytes);
    let scheme = Pkcs1v15Sign::new::<Sha256>();

    for TrustedKey(key) in trusted_keys {
        if key.verify(scheme.clone(), &digest, &sig_bytes).is_ok() {
            return Ok(true);
        }
    }

    Err(SignatureError::VerificationFailed)
}

fn sibling_sig_path(bundle_path: &Path) -> std::path::PathBuf {
    let mut sig = bundle_path.as_os_str().to_os_string();
    sig.push(".sig");
    std::path::PathBuf::from(sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;
    use std::io::Write;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    fn sign(private: &RsaPrivateKey, bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        let scheme = Pkcs1v15Sign::new::<Sha256>();
        let sig = private.sign(scheme, &digest).unwrap();
        base64::engine::general_purpose::STANDARD.encode(sig)
    }

    #[test]
    fn test_verify_valid_signature() {
        let (private, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("plugin.dlc");
        std::fs::write(&bundle_path, b"bundle contents").unwrap();

        let sig_b64 = sign(&private, b"bundle contents");
        std::fs::write(sibling_sig_path(&bundle_path), sig_b64).unwrap();

        let trusted = vec![TrustedKey(public)];
        let policy = SignaturePolicy {
            required: true,
            verify_if_present: true,
        };

        assert!(verify_bundle_signature(&bundle_path, &trusted, policy).unwrap());
    }

    #[test]
    fn test_tampered_bundle_fails_verification() {
        let (private, public) = keypair();
        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("plugin.dlc");
        std::fs::write(&bundle_path, b"original contents").unwrap();

        let sig_b64 = sign(&private, b"original contents");
        std::fs::write(sibling_sig_path(&bundle_path), sig_b64).unwrap();

        // Tamper with the bundle after signing.
        std::fs::write(&bundle_path, b"tampered contents").unwrap();

        let trusted = vec![TrustedKey(public)];
        let policy = SignaturePolicy {
            required: true,
            verify_if_present: true,
        };

        assert!(verify_bundle_signature(&bundle_path, &trusted, policy).is_err());
    }

    #[test]
    fn test_missing_signature_required_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("plugin.dlc");
        std::fs::write(&bundle_path, b"contents").unwrap();

        let policy = SignaturePolicy {
            required: true,
            verify_if_present: true,
        };

        let err = verify_bundle_signature(&bundle_path, &[], policy).unwrap_err();
        assert!(matches!(err, SignatureError::MissingSignature(_)));
    }

    #[test]
    fn test_missing_signature_optional_allows_load() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("plugin.dlc");
        std::fs::write(&bundle_path, b"contents").unwrap();

        let policy = SignaturePolicy {
            required: false,
            verify_if_present: true,
        };

        assert_eq!(
            verify_bundle_signature(&bundle_path, &[], policy).unwrap(),
            false
        );
    }

    #[test]
    fn test_load_public_keys_from_files() {
        let (_, public) = keypair();
        let pem = public.to_public_key_pem(Default::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        let mut f = std::fs::File::create(&key_path).unwrap();
        f.write_all(pem.as_bytes()).unwrap();

        let keys = load_public_keys_from_files(&[key_path]).unwrap();
        assert_eq!(keys.len(), 1);
    }
}

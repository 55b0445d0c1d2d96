//! Optional OpenSSL backend.
//!
//! Loads signer identities from PKCS #12 credential stores and implements
//! both signature seams on top of OpenSSL: [`SignerIdentity`] produces
//! detached PKCS #7 signatures, [`OpenSslVerifier`] checks them against a CA
//! store. It is enabled by the `openssl` feature.

use std::path::Path;

use anyhow::Result;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::{
    store::{X509Store, X509StoreBuilder},
    X509NameEntryRef, X509NameRef, X509,
};

use crate::Error;

/// A private key with its certificate chain. Immutable once loaded.
pub struct SignerIdentity {
    common_name: String,
    key: PKey<Private>,
    certificate: X509,
    chain: Vec<X509>,
}

impl SignerIdentity {
    /// `chain` holds the extra certificates embedded in every signature,
    /// not including `certificate` itself. `key` must be the private half of
    /// the certificate's public key.
    pub fn new(key: PKey<Private>, certificate: X509, chain: Vec<X509>) -> Result<Self> {
        let common_name = get_only_entry(certificate.subject_name(), Nid::COMMONNAME)?
            .data()
            .to_string()?;
        if !certificate.public_key()?.public_eq(&key) {
            return Err(Error::InvalidCredentials(format!(
                "private key does not match the certificate of {common_name:?}"
            ))
            .into());
        }
        Ok(Self {
            common_name,
            key,
            certificate,
            chain,
        })
    }

    /// Loads a PKCS #12 credential store.
    pub fn from_pkcs12_der(der: &[u8], password: &str) -> Result<Self> {
        let parsed = Pkcs12::from_der(der)
            .and_then(|pkcs12| pkcs12.parse2(password))
            .map_err(|e| Error::InvalidCredentials(e.to_string()))?;

        let key = parsed.pkey.ok_or(Error::MissingPrivateKey)?;
        let certificate = parsed.cert.ok_or(Error::MissingCertificate)?;
        let chain = parsed
            .ca
            .map(|ca| ca.into_iter().collect())
            .unwrap_or_default();
        Self::new(key, certificate, chain)
    }

    pub fn from_pkcs12_file(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let path = path.as_ref();
        let der = std::fs::read(path)
            .map_err(|e| Error::InvalidCredentials(format!("{}: {e}", path.display())))?;
        let identity = Self::from_pkcs12_der(&der, password)?;
        log::info!(
            "loaded identity {:?} from {}",
            identity.common_name,
            path.display()
        );
        Ok(identity)
    }

    /// Subject common name of the signing certificate.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }
}

impl crate::Pkcs7Signer for SignerIdentity {
    fn signer_name(&self) -> &str {
        &self.common_name
    }

    /// Creates a detached PKCS #7 signature with SHA-256, embedding the
    /// signer certificate and its chain.
    fn sign(&self, signed_data: [&[u8]; 2]) -> Result<Vec<u8>> {
        // OpenSSL requires a contiguous array of bytes to sign.
        let mut contiguous = Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
        contiguous.extend_from_slice(signed_data[0]);
        contiguous.extend_from_slice(signed_data[1]);

        let mut certs = Stack::new()?;
        for cert in &self.chain {
            certs.push(cert.clone())?;
        }

        let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOSMIMECAP;
        let pkcs7 = Pkcs7::sign(&self.certificate, &self.key, &certs, &contiguous, flags)?;
        Ok(pkcs7.to_der()?)
    }
}

/// OpenSSL implementation of the signature verifier.
pub struct OpenSslVerifier {
    ca_store: X509Store,
    intermediaries: Stack<X509>,
}

impl OpenSslVerifier {
    /// Creates a new verifier with the given CA store and a set of untrusted
    /// intermediary certificates that might be needed in the verification.
    pub fn new(ca_store: X509Store, intermediaries: Stack<X509>) -> Self {
        Self {
            ca_store,
            intermediaries,
        }
    }
}

impl crate::Pkcs7Verifier for &OpenSslVerifier {
    /// Uses `openssl` crate [`Pkcs7`] structure as the returned value.
    ///
    /// It contains all the information about the signature, including the
    /// signer's certificate and identity.
    type Return = Pkcs7;

    /// Verifies a PKCS #7 signature using OpenSSL.
    fn verify(&self, pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> Result<Self::Return> {
        let mut contiguous = Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
        contiguous.extend_from_slice(signed_data[0]);
        contiguous.extend_from_slice(signed_data[1]);

        let pkcs7 = Pkcs7::from_der(pkcs7_der)?;
        pkcs7.verify(
            &self.intermediaries,
            &self.ca_store,
            Some(&contiguous),
            None,
            Pkcs7Flags::empty(),
        )?;

        Ok(pkcs7)
    }
}

/// Loads CA certificates from a directory containing PEM files.
pub fn load_ca_bundle_from_dir<P: AsRef<Path>>(dir: P) -> Result<X509StoreBuilder> {
    let mut builder = X509StoreBuilder::new()?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let cert = X509::from_pem(&std::fs::read(&path)?)?;
        builder.add_cert(cert)?;
    }

    Ok(builder)
}

/// Common names of the certificates that signed `pkcs7`.
pub fn signer_common_names(pkcs7: &Pkcs7) -> Result<Vec<String>> {
    let empty_stack = Stack::new()?;
    let signers = pkcs7.signers(&empty_stack, Pkcs7Flags::empty())?;
    signers
        .iter()
        .map(|signer| {
            let cn = get_only_entry(signer.subject_name(), Nid::COMMONNAME)?;
            Ok(cn.data().to_string()?)
        })
        .collect()
}

/// Errors out if there is not exactly one entry with the given NID in the
/// distinguished name.
fn get_only_entry(name: &X509NameRef, nid: Nid) -> Result<&X509NameEntryRef> {
    let mut entries = name.entries_by_nid(nid);
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err(Error::InvalidCredentials(
            "certificate subject must have exactly one common name".into(),
        )
        .into()),
    }
}

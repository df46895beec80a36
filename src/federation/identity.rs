//! Local federation identity
//!
//! The site has a single RSA key pair shared by every local account.
//! Each account is addressed by its own actor IRI and signs with
//! `{account IRI}#main-key`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use http::{HeaderMap, HeaderValue, Method};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use url::Url;

use super::signature::{
    SIGNED_HEADERS, generate_digest, path_and_query, signature_header, signing_string,
};
use crate::config::{AccountConfig, AppConfig};
use crate::error::AppError;

/// A local account as seen by remote servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    /// Account name, the `{name}` of `acct:{name}@{domain}`
    pub name: String,
    /// Actor IRI (public address + account path)
    pub iri: String,
    /// Path the actor document is served at
    pub path: String,
    pub inbox: String,
    pub followers: String,
    pub display_name: Option<String>,
}

impl LocalAccount {
    fn new(public_address: &str, name: &str, config: &AccountConfig) -> Self {
        Self {
            name: name.to_string(),
            iri: format!("{}{}", public_address, config.path),
            path: config.path.clone(),
            inbox: format!("{}/{}/inbox", public_address, name),
            followers: format!("{}/{}/followers", public_address, name),
            display_name: config.display_name.clone(),
        }
    }

    /// Key ID used in the Signature header of this account's requests
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.iri)
    }
}

/// Serializes use of the private key
///
/// Signing is CPU bound and the key is not shared with other threads
/// while a signature is produced.
pub struct Signer {
    key: Mutex<SigningKey<Sha256>>,
    public_key_pem: String,
}

impl Signer {
    /// Parse a PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM
    pub fn from_pem(pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))?;

        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Config(format!("Failed to encode public key: {}", e)))?;

        Ok(Self {
            key: Mutex::new(SigningKey::<Sha256>::new(private_key)),
            public_key_pem,
        })
    }

    /// Public half of the key in SPKI PEM format
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Sign an outbound request in place
    ///
    /// `headers` must already carry `Date` and `Host`. Adds `Digest` for
    /// `body` and the `Signature` header covering
    /// `(request-target) date host digest`.
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        headers: &mut HeaderMap,
        body: &[u8],
        key_id: &str,
    ) -> Result<(), AppError> {
        let digest = HeaderValue::from_str(&generate_digest(body))
            .map_err(|e| AppError::Signature(format!("Invalid digest header: {}", e)))?;
        headers.insert("digest", digest);

        let signing = signing_string(
            method.as_str(),
            &path_and_query(url),
            headers,
            &SIGNED_HEADERS,
        )?;

        let signature = {
            let key = self.key.lock().unwrap_or_else(|e| e.into_inner());
            key.sign_with_rng(&mut rand::thread_rng(), signing.as_bytes())
        };

        let value = signature_header(key_id, &SIGNED_HEADERS, &signature.to_bytes());
        headers.insert(
            "signature",
            HeaderValue::from_str(&value)
                .map_err(|e| AppError::Signature(format!("Invalid signature header: {}", e)))?,
        );

        Ok(())
    }
}

/// Everything the federation layer needs to speak for this site
pub struct FederationIdentity {
    public_address: String,
    domain: String,
    accounts: BTreeMap<String, LocalAccount>,
    signer: Signer,
}

impl FederationIdentity {
    pub fn new(
        public_address: &str,
        domain: &str,
        accounts: &BTreeMap<String, AccountConfig>,
        private_key_pem: &str,
    ) -> Result<Self, AppError> {
        let signer = Signer::from_pem(private_key_pem)?;
        let accounts = accounts
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    LocalAccount::new(public_address, name, config),
                )
            })
            .collect();

        Ok(Self {
            public_address: public_address.to_string(),
            domain: domain.to_string(),
            accounts,
            signer,
        })
    }

    /// Build the identity from configuration, reading the key file
    pub fn load(config: &AppConfig) -> Result<Self, AppError> {
        let key_path = &config.activitypub.key_path;
        let pem = std::fs::read_to_string(key_path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read private key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        Self::new(
            &config.server.public_address(),
            &config.server.domain,
            &config.accounts,
            &pem,
        )
    }

    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn account(&self, name: &str) -> Option<&LocalAccount> {
        self.accounts.get(name)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &LocalAccount> {
        self.accounts.values()
    }

    pub fn public_key_pem(&self) -> &str {
        self.signer.public_key_pem()
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }
}

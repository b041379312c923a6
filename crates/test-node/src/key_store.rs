//! # Key Store
//!
//! Deterministic `did:key` keyrings for test identities. Each identity is
//! derived from a fixed Ed25519 seed, so DIDs are stable across test
//! runs.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use dwn_core::provider::Algorithm;
use ed25519_dalek::{Signer as _, SigningKey};

static ALICE: LazyLock<Keyring> = LazyLock::new(|| Keyring::new([0xa1; 32]));
static BOB: LazyLock<Keyring> = LazyLock::new(|| Keyring::new([0xb0; 32]));
static CAROL: LazyLock<Keyring> = LazyLock::new(|| Keyring::new([0xca; 32]));
static APP: LazyLock<Keyring> = LazyLock::new(|| Keyring::new([0xaa; 32]));

/// Alice's DID.
pub static ALICE_DID: LazyLock<String> = LazyLock::new(|| ALICE.did());

/// Bob's DID.
pub static BOB_DID: LazyLock<String> = LazyLock::new(|| BOB.did());

/// Carol's DID.
pub static CAROL_DID: LazyLock<String> = LazyLock::new(|| CAROL.did());

/// The DID of an application acting on a user's behalf.
pub static APP_DID: LazyLock<String> = LazyLock::new(|| APP.did());

/// Find the keyring for one of the test identities.
///
/// # Errors
///
/// Fails when the DID is not a test identity.
pub fn keyring(did: &str) -> Result<Keyring> {
    for known in [&*ALICE, &*BOB, &*CAROL, &*APP] {
        if known.did() == did {
            return Ok(known.clone());
        }
    }
    Err(anyhow!("no keyring for {did}"))
}

/// An Ed25519 keyring for a single `did:key` identity.
#[derive(Clone)]
pub struct Keyring {
    signing_key: SigningKey,
}

impl Keyring {
    fn new(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// The identity's `did:key` DID.
    #[must_use]
    pub fn did(&self) -> String {
        format!("did:key:{}", self.multibase_key())
    }

    // The public key in multibase form with the Ed25519 multicodec prefix.
    fn multibase_key(&self) -> String {
        let mut bytes = vec![0xed, 0x01];
        bytes.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        multibase::encode(multibase::Base::Base58Btc, bytes)
    }
}

impl dwn_core::provider::Keyring for Keyring {}

impl dwn_core::provider::Signer for Keyring {
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(msg).to_bytes().to_vec())
    }

    async fn public_key(&self) -> Result<Vec<u8>> {
        Ok(self.signing_key.verifying_key().as_bytes().to_vec())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::EdDsa
    }

    fn verification_method(&self) -> String {
        format!("{}#{}", self.did(), self.multibase_key())
    }
}

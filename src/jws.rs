//! # JSON Web Signature
//!
//! JWS envelopes used for message authorization. Payloads are detached
//! JSON objects (base64url-encoded); the signing input is the compact
//! `{protected}.{payload}` form. Signer DIDs are resolved through the
//! [`DidResolver`] provider to locate the verification method named by the
//! signature's `kid`.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::{DidResolver, Signer};
use crate::{Result, unexpected};

/// A general JWS with one or more signatures over a shared payload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Jws {
    /// The detached payload, base64url-encoded.
    pub payload: String,

    /// JWS signatures.
    pub signatures: Vec<Signature>,
}

/// An entry of the `signatures` array of a general JWS.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Signature {
    /// The base64url-encoded JWS protected header.
    pub protected: String,

    /// The base64url-encoded signature.
    pub signature: String,
}

/// JWS protected header.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Protected {
    /// The signing algorithm.
    pub alg: String,

    /// The verification method used to verify the signature, a DID URL
    /// referencing a key in the signer's DID document.
    pub kid: String,
}

impl Jws {
    /// Deserialize the JWS payload.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not base64url or does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.payload)
            .map_err(|e| unexpected!("issue decoding payload: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("issue deserializing payload: {e}"))
    }

    /// The DID of the signer, extracted from the first signature's `kid`.
    ///
    /// # Errors
    ///
    /// Fails when the JWS has no signatures or a malformed `kid`.
    pub fn did(&self) -> Result<String> {
        let Some(signature) = self.signatures.first() else {
            return Err(unexpected!("no signatures found"));
        };
        let protected = signature.protected()?;
        let Some((did, _)) = protected.kid.split_once('#') else {
            return Err(unexpected!("no DID found in kid"));
        };
        Ok(did.to_owned())
    }

    /// Verify every signature against the signer's DID document.
    ///
    /// # Errors
    ///
    /// Fails when a DID cannot be resolved, a verification method cannot be
    /// found, or a signature does not verify.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<()> {
        for signature in &self.signatures {
            let protected = signature.protected()?;
            let Some((did, _)) = protected.kid.split_once('#') else {
                return Err(unexpected!("no DID found in kid"));
            };

            // resolve the verification method named by `kid`
            let document = resolver
                .resolve(did)
                .await
                .map_err(|e| unexpected!("issue resolving DID {did}: {e}"))?;
            let Some(method) =
                document.verification_method.iter().find(|vm| vm.id == protected.kid)
            else {
                return Err(unexpected!("no verification method found for {kid}",
                    kid = protected.kid));
            };
            let Some(key_multibase) = &method.public_key_multibase else {
                return Err(unexpected!("verification method has no public key"));
            };

            // decode the multibase/multicodec-wrapped Ed25519 key
            let (_, key_bytes) = multibase::decode(key_multibase)
                .map_err(|e| unexpected!("issue decoding public key: {e}"))?;
            if key_bytes.len() != 34 || key_bytes[0..2] != [0xed, 0x01] {
                return Err(unexpected!("unsupported public key type"));
            }
            let key: [u8; 32] = key_bytes[2..]
                .try_into()
                .map_err(|_| unexpected!("invalid public key length"))?;
            let verifying_key = VerifyingKey::from_bytes(&key)
                .map_err(|e| unexpected!("invalid public key: {e}"))?;

            let sig_bytes = Base64UrlUnpadded::decode_vec(&signature.signature)
                .map_err(|e| unexpected!("issue decoding signature: {e}"))?;
            let sig = ed25519_dalek::Signature::from_slice(&sig_bytes)
                .map_err(|e| unexpected!("invalid signature: {e}"))?;

            let signing_input = format!("{}.{}", signature.protected, self.payload);
            verifying_key
                .verify(signing_input.as_bytes(), &sig)
                .map_err(|e| unexpected!("signature verification failed: {e}"))?;
        }

        Ok(())
    }
}

impl Signature {
    /// Deserialize the protected header.
    ///
    /// # Errors
    ///
    /// Fails when the header is not base64url-encoded JSON.
    pub fn protected(&self) -> Result<Protected> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.protected)
            .map_err(|e| unexpected!("issue decoding protected header: {e}"))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| unexpected!("issue deserializing protected header: {e}"))
    }
}

/// Builds a general JWS from a payload and one or more signers.
#[derive(Clone, Debug, Default)]
pub struct JwsBuilder<T> {
    payload: T,
}

impl<T: Serialize + Send + Sync> JwsBuilder<T> {
    /// Returns a new [`JwsBuilder`] for the payload.
    pub const fn new(payload: T) -> Self {
        Self { payload }
    }

    /// Sign the payload and generate the JWS.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be serialized or the signer fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Jws> {
        let protected = Protected {
            alg: signer.algorithm().to_string(),
            kid: signer.verification_method(),
        };
        let protected_bytes =
            serde_json::to_vec(&protected).map_err(|e| unexpected!("issue serializing: {e}"))?;
        let payload_bytes =
            serde_json::to_vec(&self.payload).map_err(|e| unexpected!("issue serializing: {e}"))?;

        let protected = Base64UrlUnpadded::encode_string(&protected_bytes);
        let payload = Base64UrlUnpadded::encode_string(&payload_bytes);

        let signing_input = format!("{protected}.{payload}");
        let signature = signer
            .try_sign(signing_input.as_bytes())
            .await
            .map_err(|e| unexpected!("issue signing: {e}"))?;

        Ok(Jws {
            payload,
            signatures: vec![Signature {
                protected,
                signature: Base64UrlUnpadded::encode_string(&signature),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result as AnyResult;
    use ed25519_dalek::{Signer as _, SigningKey};

    use super::*;
    use crate::provider::{Algorithm, Document, Signer, VerificationMethod};

    struct TestSigner {
        key: SigningKey,
    }

    impl TestSigner {
        fn new() -> Self {
            Self {
                key: SigningKey::from_bytes(&[7u8; 32]),
            }
        }

        fn did(&self) -> String {
            let mut bytes = vec![0xed, 0x01];
            bytes.extend_from_slice(self.key.verifying_key().as_bytes());
            format!("did:key:{}", multibase::encode(multibase::Base::Base58Btc, bytes))
        }
    }

    impl Signer for TestSigner {
        async fn try_sign(&self, msg: &[u8]) -> AnyResult<Vec<u8>> {
            Ok(self.key.sign(msg).to_bytes().to_vec())
        }

        async fn public_key(&self) -> AnyResult<Vec<u8>> {
            Ok(self.key.verifying_key().as_bytes().to_vec())
        }

        fn algorithm(&self) -> Algorithm {
            Algorithm::EdDsa
        }

        fn verification_method(&self) -> String {
            let did = self.did();
            let key = did.trim_start_matches("did:key:").to_string();
            format!("{did}#{key}")
        }
    }

    struct TestResolver;

    impl crate::provider::DidResolver for TestResolver {
        async fn resolve(&self, url: &str) -> AnyResult<Document> {
            let key = url.trim_start_matches("did:key:").to_string();
            Ok(Document {
                id: url.to_string(),
                verification_method: vec![VerificationMethod {
                    id: format!("{url}#{key}"),
                    controller: url.to_string(),
                    method_type: "Ed25519VerificationKey2020".to_string(),
                    public_key_multibase: Some(key),
                }],
            })
        }
    }

    #[tokio::test]
    async fn sign_and_verify() {
        let signer = TestSigner::new();
        let payload = serde_json::json!({"descriptorCid": "bafyexample"});

        let jws = JwsBuilder::new(payload).build(&signer).await.expect("should sign");
        jws.verify(&TestResolver).await.expect("should verify");
        assert_eq!(jws.did().expect("should extract did"), signer.did());
    }

    #[tokio::test]
    async fn tampered_payload_fails() {
        let signer = TestSigner::new();
        let payload = serde_json::json!({"descriptorCid": "bafyexample"});

        let mut jws = JwsBuilder::new(payload).build(&signer).await.expect("should sign");
        jws.payload = Base64UrlUnpadded::encode_string(b"{\"descriptorCid\":\"bafyother\"}");
        assert!(jws.verify(&TestResolver).await.is_err());
    }
}

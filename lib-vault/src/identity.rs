//! Node identity: paired Ed25519 / X25519 keys
//!
//! The node id is the hex BLAKE2b-256 of the Ed25519 public key. Private
//! halves stay inside the contained key pairs and are used only through
//! `sign` / `agree`.

use lib_crypto::{blake2b_256, AgreementKeyPair, SecretBuffer, SigningKeyPair};

use crate::Result;

pub struct NodeIdentity {
    signing: SigningKeyPair,
    agreement: AgreementKeyPair,
    node_id: String,
}

impl NodeIdentity {
    pub(crate) fn from_subkeys(identity_seed: &SecretBuffer, ecdh_seed: &SecretBuffer) -> Result<Self> {
        let signing = identity_seed.expose(SigningKeyPair::from_seed)?;
        let agreement = ecdh_seed.expose(AgreementKeyPair::from_seed)?;
        let node_id = hex::encode(blake2b_256(&signing.public_bytes()));
        Ok(Self {
            signing,
            agreement,
            node_id,
        })
    }

    /// Stable node identifier: hex(BLAKE2b-256(ed25519 public)).
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ed25519_public(&self) -> [u8; 32] {
        self.signing.public_bytes()
    }

    pub fn x25519_public(&self) -> [u8; 32] {
        self.agreement.public_bytes()
    }

    /// Detached Ed25519 signature with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message)
    }

    /// X25519 agreement with a peer public key.
    pub fn agree(&self, peer_x25519_public: &[u8]) -> Result<SecretBuffer> {
        Ok(self.agreement.agree(peer_x25519_public)?)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish()
    }
}

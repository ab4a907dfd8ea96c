//! Access control, payload encryption, peer authentication, and discovery
//! key derivation (spec §4.4).

pub mod acl;
pub mod crypto;
pub mod peer_auth;

pub use acl::{AccessControl, AclMode};
pub use crypto::{decrypt_payload, derive_discovery_key, encrypt_payload, EncryptedPayload};
pub use peer_auth::{AuthenticatedPeer, PeerAuthenticator};

//! Peer identity: the peer identifier and the identity file format.
//!
//! Key generation is left to the caller. This module reads, validates and
//! writes the `{ id, privKey, pubKey }` JSON document, whose keys are base64
//! protobuf-encoded libp2p keys, and decodes it into the [`Keypair`] a
//! transport runs the node with (see
//! [`MemoryNetwork::add_peer_with_identity`](crate::memory::MemoryNetwork::add_peer_with_identity)).

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose};
use libp2p_identity::{Keypair, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PeerError;

/// A unique identifier for a peer node.
///
/// Ordering is the ordering of the base58 text form; it is used to decide
/// which side of a pair of peers is responsible for connection convergence.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(libp2p_identity::PeerId);

impl PeerId {
    /// A random identifier not backed by a key.
    pub fn random() -> Self {
        Self(libp2p_identity::PeerId::random())
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(key.to_peer_id())
    }

    pub fn as_libp2p(&self) -> &libp2p_identity::PeerId {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        self.0.to_base58()
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.to_base58().cmp(&other.0.to_base58())
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.0.to_base58()).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_base58())
    }
}

impl From<libp2p_identity::PeerId> for PeerId {
    fn from(id: libp2p_identity::PeerId) -> Self {
        Self(id)
    }
}

impl FromStr for PeerId {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<libp2p_identity::PeerId>()
            .map(Self)
            .map_err(|e| PeerError::InvalidIdentity(format!("bad peer id '{s}': {e}")))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0.to_base58())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// On-disk peer identity: `{ "id", "privKey", "pubKey" }` with base64 keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdFile {
    pub id: String,
    pub priv_key: String,
    pub pub_key: String,
}

impl PeerIdFile {
    /// Encode an existing keypair as an identity document.
    pub fn from_keypair(keypair: &Keypair) -> Result<Self, PeerError> {
        let private = keypair
            .to_protobuf_encoding()
            .map_err(|e| PeerError::InvalidIdentity(format!("privKey: {e}")))?;
        let public = keypair.public();
        Ok(Self {
            id: public.to_peer_id().to_base58(),
            priv_key: general_purpose::STANDARD.encode(private),
            pub_key: general_purpose::STANDARD.encode(public.encode_protobuf()),
        })
    }

    /// Read and validate an identity file.
    pub fn load(path: &Path) -> Result<Self, PeerError> {
        let data = std::fs::read_to_string(path)?;
        let file: PeerIdFile = serde_json::from_str(&data)?;
        file.validate()?;
        Ok(file)
    }

    /// Write the identity to a JSON file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), PeerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PeerError> {
        self.keypair().map(|_| ())
    }

    /// Decode the keypair, checking that the id and both keys agree.
    pub fn keypair(&self) -> Result<Keypair, PeerError> {
        let keypair = Keypair::from_protobuf_encoding(&self.private_key()?)
            .map_err(|e| PeerError::InvalidIdentity(format!("privKey: {e}")))?;
        let public = PublicKey::try_decode_protobuf(&self.public_key()?)
            .map_err(|e| PeerError::InvalidIdentity(format!("pubKey: {e}")))?;

        if keypair.public() != public {
            return Err(PeerError::InvalidIdentity(
                "pubKey does not belong to privKey".into(),
            ));
        }
        if self.peer_id()? != PeerId::from_public_key(&public) {
            return Err(PeerError::InvalidIdentity(format!(
                "id {} does not match pubKey",
                self.id
            )));
        }
        Ok(keypair)
    }

    pub fn peer_id(&self) -> Result<PeerId, PeerError> {
        self.id.parse()
    }

    /// Decoded private key bytes.
    pub fn private_key(&self) -> Result<Vec<u8>, PeerError> {
        general_purpose::STANDARD
            .decode(&self.priv_key)
            .map_err(|e| PeerError::InvalidIdentity(format!("privKey: {e}")))
    }

    /// Decoded public key bytes.
    pub fn public_key(&self) -> Result<Vec<u8>, PeerError> {
        general_purpose::STANDARD
            .decode(&self.pub_key)
            .map_err(|e| PeerError::InvalidIdentity(format!("pubKey: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "12D3KooWDwoZsUupWJSqJVV75axnChkY8CzEakoLjRbRBi6LiAQF";

    #[test]
    fn test_peer_id_ordering_is_string_ordering() {
        let ids: Vec<PeerId> = (0..8).map(|_| PeerId::random()).collect();
        for a in &ids {
            for b in &ids {
                assert_eq!(a.cmp(b), a.to_string().cmp(&b.to_string()));
            }
        }
    }

    #[test]
    fn test_peer_id_parse() {
        let id: PeerId = PEER.parse().unwrap();
        assert_eq!(id.to_string(), PEER);
        assert_eq!(format!("{id:?}"), format!("PeerId(\"{PEER}\")"));
        assert!("peer/1".parse::<PeerId>().is_err());
        assert!("".parse::<PeerId>().is_err());
        assert!("peer-a".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_serde_as_string() {
        let id: PeerId = PEER.parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{PEER}\""));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<PeerId>("\"nope\"").is_err());
    }

    #[test]
    fn test_identity_file_wire_format() {
        let keypair = Keypair::generate_ed25519();
        let file = PeerIdFile::from_keypair(&keypair).unwrap();
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["id"], keypair.public().to_peer_id().to_base58());
        assert!(json["privKey"].is_string());
        assert!(json["pubKey"].is_string());

        let decoded = file.keypair().unwrap();
        assert_eq!(decoded.public(), keypair.public());
        assert_eq!(
            file.peer_id().unwrap(),
            PeerId::from_public_key(&keypair.public())
        );
    }

    #[test]
    fn test_identity_file_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peer-id.json");

        let original = PeerIdFile::from_keypair(&Keypair::generate_ed25519()).unwrap();
        original.save_to_file(&path).unwrap();

        let loaded = PeerIdFile::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_identity_file_rejects_bad_base64() {
        let mut file = PeerIdFile::from_keypair(&Keypair::generate_ed25519()).unwrap();
        file.priv_key = "***".into();
        match file.validate() {
            Err(PeerError::InvalidIdentity(msg)) => assert!(msg.contains("privKey")),
            other => panic!("Expected InvalidIdentity, got {other:?}"),
        }
    }

    #[test]
    fn test_identity_file_rejects_mismatched_keys() {
        let mine = PeerIdFile::from_keypair(&Keypair::generate_ed25519()).unwrap();
        let other = PeerIdFile::from_keypair(&Keypair::generate_ed25519()).unwrap();

        let mut wrong_id = mine.clone();
        wrong_id.id = other.id.clone();
        assert!(matches!(wrong_id.validate(), Err(PeerError::InvalidIdentity(_))));

        let mut wrong_pub = mine.clone();
        wrong_pub.pub_key = other.pub_key.clone();
        assert!(matches!(wrong_pub.validate(), Err(PeerError::InvalidIdentity(_))));

        mine.validate().unwrap();
    }
}

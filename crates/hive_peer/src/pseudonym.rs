//! Deterministic human-readable names for peer ids.
//!
//! Peer ids are long and hard to tell apart in logs, so every log line that
//! names a peer also carries a short `adjective-color-name` pseudonym derived
//! from a SHA-256 of the id.

use sha2::{Digest, Sha256};

use crate::identity::PeerId;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively", "merry",
    "nimble", "proud", "quick", "silly", "swift", "witty",
];

const COLORS: &[&str] = &[
    "amber", "azure", "coral", "crimson", "cyan", "golden", "indigo", "ivory", "jade", "lime",
    "magenta", "olive", "plum", "ruby", "silver", "teal",
];

const NAMES: &[&str] = &[
    "badger", "falcon", "gecko", "heron", "ibis", "jackal", "koala", "lemur", "marten", "newt",
    "otter", "panda", "quail", "raven", "stoat", "walrus",
];

/// The pseudonym for a peer id, e.g. `swift-teal-otter`.
pub fn pseudonym(peer_id: &PeerId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(peer_id.to_base58().as_bytes());
    let digest = hasher.finalize();

    let pick = |list: &[&'static str], byte: u8| list[byte as usize % list.len()];
    format!(
        "{}-{}-{}",
        pick(ADJECTIVES, digest[0]),
        pick(COLORS, digest[1]),
        pick(NAMES, digest[2])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudonym_is_stable() {
        let id: PeerId = "12D3KooWDwoZsUupWJSqJVV75axnChkY8CzEakoLjRbRBi6LiAQF"
            .parse()
            .unwrap();
        assert_eq!(pseudonym(&id), pseudonym(&id.clone()));
        assert_eq!(pseudonym(&id).split('-').count(), 3);
    }

    #[test]
    fn test_pseudonyms_differ_across_ids() {
        let names: std::collections::HashSet<String> = (0..32)
            .map(|_| pseudonym(&PeerId::random()))
            .collect();
        assert!(names.len() > 1);
    }
}

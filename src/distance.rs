//! # Proximity Metric
//!
//! Distance between two positions is the popcount of their XOR: the number
//! of differing bits across the 32-byte digests. A peer's position is the
//! Blake2b hash of its address text; a query's position is the Blake2b hash
//! of the query bytes. Candidate sets are ranked ascending by that distance
//! with a stable tiebreak, so equal inputs always rank identically.

use crate::hashing::{self, Digest};
use crate::identity::Address;

/// Number of differing bits between two digests (0..=256).
pub fn xor_popcount(a: &Digest, b: &Digest) -> u32 {
    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Routing position of a peer: Blake2b over the address text.
pub fn address_position(addr: &Address) -> Digest {
    hashing::blake2b(addr.position_bytes())
}

/// Routing position of an arbitrary query byte string.
pub fn query_position(query: &[u8]) -> Digest {
    hashing::blake2b(query)
}

/// Rank `candidates` ascending by distance to `target`, keeping at most `n`.
///
/// The sort is stable: candidates at equal distance keep their input order.
pub fn nearest_addresses(target: &Digest, candidates: Vec<Address>, n: usize) -> Vec<Address> {
    let mut ranked: Vec<(u32, Address)> = candidates
        .into_iter()
        .map(|addr| (xor_popcount(target, &address_position(&addr)), addr))
        .collect();
    ranked.sort_by_key(|(dist, _)| *dist);
    ranked.truncate(n);
    ranked.into_iter().map(|(_, addr)| addr).collect()
}

/// Distance from `target` to the given address's position.
pub fn address_distance(target: &Digest, addr: &Address) -> u32 {
    xor_popcount(target, &address_position(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn addr(seed: u8) -> Address {
        Keypair::from_secret_key_bytes(&[seed; 32]).address()
    }

    #[test]
    fn popcount_is_zero_on_self_and_symmetric() {
        let a = hashing::blake2b(b"a");
        let b = hashing::blake2b(b"b");
        assert_eq!(xor_popcount(&a, &a), 0);
        assert_eq!(xor_popcount(&a, &b), xor_popcount(&b, &a));
    }

    #[test]
    fn popcount_counts_differing_bits() {
        let zero = Digest::from_bytes([0u8; 32]);
        let mut one_bit = [0u8; 32];
        one_bit[0] = 0b1000_0000;
        assert_eq!(xor_popcount(&zero, &Digest::from_bytes(one_bit)), 1);
        let ones = Digest::from_bytes([0xFF; 32]);
        assert_eq!(xor_popcount(&zero, &ones), 256);
    }

    #[test]
    fn ranking_orders_by_distance_and_truncates() {
        let target = hashing::blake2b(b"target");
        let candidates: Vec<Address> = (1..=8).map(addr).collect();
        let nearest = nearest_addresses(&target, candidates.clone(), 3);
        assert_eq!(nearest.len(), 3);

        let mut expected: Vec<(u32, Address)> = candidates
            .into_iter()
            .map(|a| (address_distance(&target, &a), a))
            .collect();
        expected.sort_by_key(|(d, _)| *d);
        let expected: Vec<Address> = expected.into_iter().take(3).map(|(_, a)| a).collect();
        assert_eq!(nearest, expected);
    }

    #[test]
    fn ranking_is_deterministic_for_equal_inputs() {
        let target = hashing::blake2b(b"q");
        let candidates: Vec<Address> = (1..=6).map(addr).collect();
        let first = nearest_addresses(&target, candidates.clone(), 6);
        let second = nearest_addresses(&target, candidates, 6);
        assert_eq!(first, second);
    }

    #[test]
    fn ranking_handles_degenerate_candidate_sets() {
        let target = hashing::blake2b(b"edge");
        assert!(nearest_addresses(&target, Vec::new(), 3).is_empty());

        let two: Vec<Address> = vec![addr(20), addr(21)];
        let ranked = nearest_addresses(&target, two.clone(), 5);
        assert_eq!(ranked.len(), 2, "n beyond the candidate count returns all");
        assert!(nearest_addresses(&target, two, 0).is_empty());
    }

    #[test]
    fn position_depends_on_address_text() {
        let a = addr(10);
        let b = addr(11);
        assert_ne!(address_position(&a), address_position(&b));
        assert_eq!(address_position(&a), address_position(&a));
    }
}

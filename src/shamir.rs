//! # Shamir Secret Sharing
//!
//! Byte-wise Shamir split and combine over GF(256). For each secret byte a
//! random polynomial of degree `threshold - 1` is sampled with the secret
//! byte as its constant term; share `i` is the polynomial evaluated at
//! `x = i`. Any `threshold` distinct shares reconstruct the secret via
//! Lagrange interpolation at `x = 0`; fewer reveal nothing.

use gf256::gf256;
use rand::RngCore;
use rand::rngs::OsRng;

/// Errors produced by [`split`] and [`combine`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShamirError {
    #[error("threshold must be at least 1")]
    ZeroThreshold,
    #[error("threshold {threshold} exceeds share count {shares}")]
    ThresholdTooLarge { threshold: u8, shares: u8 },
    #[error("no shares provided")]
    NoShares,
    #[error("shares have mismatched lengths")]
    LengthMismatch,
    #[error("duplicate share index {0}")]
    DuplicateIndex(u8),
    #[error("share index 0 is reserved")]
    ZeroIndex,
}

/// One output of a split: the evaluation point and the per-byte values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub index: u8,
    pub data: Vec<u8>,
}

impl Share {
    /// Flat byte form: the index byte followed by the share data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.index);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the flat byte form produced by [`Share::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShamirError> {
        let (&index, data) = bytes.split_first().ok_or(ShamirError::NoShares)?;
        if index == 0 {
            return Err(ShamirError::ZeroIndex);
        }
        Ok(Self {
            index,
            data: data.to_vec(),
        })
    }
}

/// Split `secret` into `shares` shares, any `threshold` of which recombine.
pub fn split(secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Share>, ShamirError> {
    if threshold == 0 {
        return Err(ShamirError::ZeroThreshold);
    }
    if threshold > shares {
        return Err(ShamirError::ThresholdTooLarge { threshold, shares });
    }

    let mut outputs: Vec<Share> = (1..=shares)
        .map(|index| Share {
            index,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coeffs = vec![0u8; threshold as usize];
    for &byte in secret {
        coeffs[0] = byte;
        OsRng.fill_bytes(&mut coeffs[1..]);

        for share in outputs.iter_mut() {
            let x = gf256::new(share.index);
            // Horner evaluation, highest coefficient first.
            let mut acc = gf256::new(0);
            for &c in coeffs.iter().rev() {
                acc = acc * x + gf256::new(c);
            }
            share.data.push(u8::from(acc));
        }
    }

    Ok(outputs)
}

/// Reconstruct the secret from any `threshold` or more distinct shares.
pub fn combine(shares: &[Share]) -> Result<Vec<u8>, ShamirError> {
    let first = shares.first().ok_or(ShamirError::NoShares)?;
    let len = first.data.len();
    for share in shares {
        if share.data.len() != len {
            return Err(ShamirError::LengthMismatch);
        }
        if share.index == 0 {
            return Err(ShamirError::ZeroIndex);
        }
    }
    let mut seen = [false; 256];
    for share in shares {
        if seen[share.index as usize] {
            return Err(ShamirError::DuplicateIndex(share.index));
        }
        seen[share.index as usize] = true;
    }

    // Lagrange basis weights at x = 0. In GF(2^8) subtraction is XOR, so
    // x_m - x_j never vanishes for distinct indexes.
    let mut secret = Vec::with_capacity(len);
    for byte_idx in 0..len {
        let mut acc = gf256::new(0);
        for (j, share_j) in shares.iter().enumerate() {
            let xj = gf256::new(share_j.index);
            let mut weight = gf256::new(1);
            for (m, share_m) in shares.iter().enumerate() {
                if m == j {
                    continue;
                }
                let xm = gf256::new(share_m.index);
                weight = weight * (xm / (xm - xj));
            }
            acc += weight * gf256::new(share_j.data[byte_idx]);
        }
        secret.push(u8::from(acc));
    }

    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_all_shares() {
        let secret = b"the quick brown fox".to_vec();
        let shares = split(&secret, 5, 3).expect("split");
        assert_eq!(shares.len(), 5);
        assert_eq!(combine(&shares).expect("combine"), secret);
    }

    #[test]
    fn any_threshold_subset_reconstructs() {
        let secret = b"swarm envelope".to_vec();
        let shares = split(&secret, 5, 3).expect("split");
        for skip_a in 0..5 {
            for skip_b in (skip_a + 1)..5 {
                let subset: Vec<Share> = shares
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != skip_a && *i != skip_b)
                    .map(|(_, s)| s.clone())
                    .collect();
                assert_eq!(subset.len(), 3);
                assert_eq!(combine(&subset).expect("combine"), secret);
            }
        }
    }

    #[test]
    fn below_threshold_yields_garbage_or_differs() {
        let secret = b"confidential".to_vec();
        let shares = split(&secret, 5, 3).expect("split");
        let two = combine(&shares[..2]).expect("interpolation still runs");
        // Two points of a quadratic do not determine it.
        assert_ne!(two, secret);
    }

    #[test]
    fn combining_more_than_threshold_shares_still_reconstructs() {
        let secret = b"surplus points".to_vec();
        let shares = split(&secret, 5, 3).expect("split");
        assert_eq!(combine(&shares[..4]).expect("combine"), secret);
        assert_eq!(combine(&shares).expect("combine"), secret);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(split(b"s", 5, 0), Err(ShamirError::ZeroThreshold));
        assert_eq!(
            split(b"s", 2, 3),
            Err(ShamirError::ThresholdTooLarge { threshold: 3, shares: 2 })
        );
    }

    #[test]
    fn rejects_malformed_share_sets() {
        assert_eq!(combine(&[]), Err(ShamirError::NoShares));

        let shares = split(b"abc", 3, 2).expect("split");
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert_eq!(combine(&dup), Err(ShamirError::DuplicateIndex(shares[0].index)));

        let mismatched = vec![
            shares[0].clone(),
            Share { index: 9, data: vec![1] },
        ];
        assert_eq!(combine(&mismatched), Err(ShamirError::LengthMismatch));
    }

    #[test]
    fn share_bytes_round_trip() {
        let share = Share { index: 4, data: vec![1, 2, 3] };
        let back = Share::from_bytes(&share.to_bytes()).expect("parse");
        assert_eq!(share, back);
        assert_eq!(Share::from_bytes(&[0, 1]), Err(ShamirError::ZeroIndex));
        assert_eq!(Share::from_bytes(&[]), Err(ShamirError::NoShares));
    }

    #[test]
    fn empty_secret_splits_and_combines() {
        let shares = split(b"", 5, 3).expect("split");
        assert!(shares.iter().all(|s| s.data.is_empty()));
        assert_eq!(combine(&shares[..3]).expect("combine"), Vec::<u8>::new());
    }
}

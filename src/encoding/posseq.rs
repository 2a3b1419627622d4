//! Run-length encoded position deltas for cluster blocks.
//!
//! Positions are walked from last to first; each gap `p[i] - p[i-1] - 1`
//! becomes part of a `(count, delta)` byte pair. Decoding needs only the
//! last position, which is the block key.

use crate::error::{Error, Result};

const MAX_RUN: u8 = u8::MAX;

/// Largest gap between neighbouring positions a run can express.
pub const MAX_GAP: u32 = u8::MAX as u32 + 1;

pub fn encode(positions: &[u32]) -> Result<Vec<u8>> {
    if positions.is_empty() {
        return Err(Error::precondition("empty position sequence"));
    }

    // The leading pair absorbs an initial run of zero deltas.
    let mut runs: Vec<u8> = vec![0, 0];
    for idx in (1..positions.len()).rev() {
        let (prev, cur) = (positions[idx - 1], positions[idx]);
        if cur <= prev {
            return Err(Error::precondition(format!(
                "positions not strictly increasing: {prev} then {cur}"
            )));
        }
        let gap = cur - prev;
        if gap > MAX_GAP {
            return Err(Error::precondition(format!(
                "position gap {gap} exceeds {MAX_GAP}"
            )));
        }
        let delta = (gap - 1) as u8;
        let n = runs.len();
        if runs[n - 1] == delta && runs[n - 2] < MAX_RUN {
            runs[n - 2] += 1;
        } else {
            runs.extend_from_slice(&[1, delta]);
        }
    }
    if runs.len() > 2 && runs[0] == 0 {
        runs.drain(..2);
    }
    Ok(runs)
}

pub fn decode(data: &[u8], last: u32) -> Result<Vec<u32>> {
    if data.len() % 2 != 0 {
        return Err(Error::decode(
            "position runs",
            format!("odd length {}", data.len()),
        ));
    }

    let mut reversed = vec![last];
    for pair in data.chunks_exact(2) {
        let (count, delta) = (pair[0], pair[1] as u32);
        for _ in 0..count {
            let prev = reversed[reversed.len() - 1];
            let pos = prev.checked_sub(delta + 1).ok_or_else(|| {
                Error::decode("position runs", format!("position underflow below {prev}"))
            })?;
            reversed.push(pos);
        }
    }
    reversed.reverse();
    Ok(reversed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_position() {
        let data = encode(&[42]).unwrap();
        assert_eq!(data, vec![0, 0]);
        assert_eq!(decode(&data, 42).unwrap(), vec![42]);
    }

    #[test]
    fn test_consecutive_positions_use_sentinel() {
        let data = encode(&[10, 11, 12, 13]).unwrap();
        assert_eq!(data, vec![3, 0]);
        assert_eq!(decode(&data, 13).unwrap(), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_mixed_gaps() {
        let positions = [100, 105, 110, 111, 200];
        let data = encode(&positions).unwrap();
        // walked from the end: gap 89, gap 1, then gap 5 twice
        assert_eq!(data, vec![1, 88, 1, 0, 2, 4]);
        assert_eq!(decode(&data, 200).unwrap(), positions.to_vec());
    }

    #[test]
    fn test_long_runs_split() {
        let positions: Vec<u32> = (0..600).collect();
        let data = encode(&positions).unwrap();
        assert_eq!(data, vec![255, 0, 255, 0, 89, 0]);
        assert_eq!(decode(&data, 599).unwrap(), positions);
    }

    #[test]
    fn test_rejects_bad_sequences() {
        assert!(matches!(encode(&[]), Err(Error::Precondition(_))));
        assert!(matches!(encode(&[5, 5]), Err(Error::Precondition(_))));
        assert!(matches!(encode(&[5, 3]), Err(Error::Precondition(_))));
        assert!(matches!(encode(&[0, 1000]), Err(Error::Precondition(_))));
        assert!(matches!(decode(&[1], 10), Err(Error::Decode(..))));
        assert!(matches!(decode(&[1, 20], 10), Err(Error::Decode(..))));
    }

    fn increasing_positions() -> impl Strategy<Value = Vec<u32>> {
        (0u32..1_000_000, prop::collection::vec(1u32..=MAX_GAP, 0..200)).prop_map(
            |(start, gaps)| {
                let mut positions = vec![start];
                for gap in gaps {
                    positions.push(positions[positions.len() - 1] + gap);
                }
                positions
            },
        )
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(positions in increasing_positions()) {
            let data = encode(&positions).unwrap();
            let last = positions[positions.len() - 1];
            prop_assert_eq!(decode(&data, last).unwrap(), positions);
        }
    }
}

// This file is part of SEELE-CORE.
//
// Copyright (C) 2022 Seele Contributors.
//
// SEELE-CORE is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// SEELE-CORE is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with SEELE-CORE. If not, see <https://www.gnu.org/licenses/>.

//! Proof-of-work arithmetic: difficulty retargeting, target derivation and
//! the seal predicate.

use crate::{base::schema::BlockHeader, crypto::Hash, Error, ErrorKind, Result};
use num_bigint::BigUint;
use num_traits::One;

/// Retarget denominator: the difficulty moves by `parent/2048` steps.
const DIFFICULTY_BOUND_DIVISOR: u32 = 2048;

/// Seconds per retarget step.
const RETARGET_INTERVAL: u64 = 10;

/// Lower clamp of the retarget multiplier.
const RETARGET_FLOOR: u64 = 99;

/// Expected difficulty of a child created at `timestamp` on top of `parent`.
///
/// `diff = parent + parent/2048 * max(1 - (timestamp - parent_ts)/10, -99)`,
/// floored at one.
pub fn get_difficult(timestamp: u64, parent: &BlockHeader) -> BigUint {
    let parent_diff = &parent.difficulty;
    let adjust = parent_diff / DIFFICULTY_BOUND_DIVISOR;
    let interval = timestamp.saturating_sub(parent.create_timestamp) / RETARGET_INTERVAL;

    if interval == 0 {
        parent_diff + adjust
    } else {
        let steps = std::cmp::min(interval - 1, RETARGET_FLOOR);
        let decrease = adjust * steps;
        if decrease >= *parent_diff {
            BigUint::one()
        } else {
            std::cmp::max(parent_diff - decrease, BigUint::one())
        }
    }
}

/// PoW target for the given difficulty: `2^256 / difficulty`.
pub fn mining_target(difficulty: &BigUint) -> BigUint {
    let numerator = BigUint::one() << 256;
    if difficulty.is_one() || *difficulty == BigUint::default() {
        numerator
    } else {
        numerator / difficulty
    }
}

/// True when the hash, read as a big-endian integer, does not exceed target.
pub fn satisfies_target(hash: &Hash, target: &BigUint) -> bool {
    BigUint::from_bytes_be(hash.hash_value()) <= *target
}

/// Validate the seal of a header against its own declared difficulty.
pub fn verify_seal(header: &BlockHeader) -> Result<()> {
    let target = mining_target(&header.difficulty);
    if satisfies_target(&header.hash(), &target) {
        Ok(())
    } else {
        Err(Error::new_ext(
            ErrorKind::InvalidSeal,
            format!("header {} above target", header.hash().to_hex()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::create_test_header;

    #[test]
    fn difficulty_grows_on_fast_blocks() {
        let parent = create_test_header(Hash::default(), 1, 4096);

        // Child 5 seconds after the parent.
        let diff = get_difficult(parent.create_timestamp + 5, &parent);

        assert_eq!(diff, BigUint::from(4096_u32 + 2));
    }

    #[test]
    fn difficulty_steady_within_first_interval() {
        let parent = create_test_header(Hash::default(), 1, 4096);

        // Interval lands exactly on one retarget step: no adjustment.
        let diff = get_difficult(parent.create_timestamp + 10, &parent);

        assert_eq!(diff, BigUint::from(4096_u32));
    }

    #[test]
    fn difficulty_shrinks_on_slow_blocks() {
        let parent = create_test_header(Hash::default(), 1, 4096);

        let diff = get_difficult(parent.create_timestamp + 30, &parent);

        assert_eq!(diff, BigUint::from(4096_u32 - 4));
    }

    #[test]
    fn difficulty_never_below_one() {
        let parent = create_test_header(Hash::default(), 1, 2);

        let diff = get_difficult(parent.create_timestamp + 100_000, &parent);

        assert_eq!(diff, BigUint::one());
    }

    #[test]
    fn unit_difficulty_accepts_any_hash() {
        let header = create_test_header(Hash::default(), 1, 1);

        verify_seal(&header).unwrap();
    }

    #[test]
    fn impossible_difficulty_rejects() {
        let mut header = create_test_header(Hash::default(), 1, 1);
        // 2^256 / 2^248 leaves an 8-bit target, virtually impossible to meet.
        header.difficulty = BigUint::one() << 248;

        let err = verify_seal(&header).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSeal);
    }

    #[test]
    fn seal_predicate_is_pure() {
        let header = create_test_header(Hash::default(), 3, 1);
        let target = mining_target(&header.difficulty);

        let one = satisfies_target(&header.hash(), &target);
        let two = satisfies_target(&header.hash(), &target);

        assert_eq!(one, two);
    }
}

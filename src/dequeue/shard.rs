// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Account-to-worker assignment.
//!
//! `owner(account) = u64_be(sha256(lowercase(account))[..8]) % count`. The
//! function is pure, so every worker computes the same owner for an account
//! without talking to the others. A fleet resize changes the modulus and
//! ownership follows on the next recovery scan.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAssignment {
    pub index: u64,
    pub count: u64,
}

impl ShardAssignment {
    /// A single worker owning every account.
    pub const SOLO: Self = Self { index: 0, count: 1 };

    pub fn new(index: u64, count: u64) -> Self {
        Self { index, count }
    }

    /// Worker index that owns `account`.
    pub fn owner_of(&self, account: &str) -> u64 {
        if self.count <= 1 {
            return 0;
        }
        shard_hash(account) % self.count
    }

    pub fn owns(&self, account: &str) -> bool {
        self.owner_of(account) == self.index
    }
}

fn shard_hash(account: &str) -> u64 {
    let digest = Sha256::digest(account.to_lowercase().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_worker_owns_everything() {
        assert!(ShardAssignment::SOLO.owns("0xabc"));
        assert!(ShardAssignment::SOLO.owns(""));
    }

    #[test]
    fn exactly_one_worker_owns_each_account() {
        for n in 0..64 {
            let account = format!("0x{n:040x}");
            let owners = (0..3)
                .filter(|i| ShardAssignment::new(*i, 3).owns(&account))
                .count();
            assert_eq!(owners, 1, "account {account}");
        }
    }

    #[test]
    fn ownership_ignores_address_case() {
        let shards = ShardAssignment::new(0, 4);
        assert_eq!(
            shards.owner_of("0x5425890298aed601595a70AB815c96711a31Bc65"),
            shards.owner_of("0x5425890298AED601595A70AB815C96711A31BC65"),
        );
    }

    #[test]
    fn accounts_spread_over_workers() {
        let shards = ShardAssignment::new(0, 2);
        let owned = (0..200)
            .filter(|n| shards.owns(&format!("0x{n:040x}")))
            .count();
        assert!(owned > 50 && owned < 150, "skewed split: {owned}/200");
    }
}

// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Policy deciding whether an operation across N backend stores succeeded.
///
/// Pure arithmetic over success/failure counts; the combined store asks
/// `is_met` after the attempt loop and `can_be_met` after every individual
/// attempt to stop early once the quorum is unreachable.
pub trait QuorumStrategy: Send + Sync + std::fmt::Debug {
    /// Whether `success` out of `total` stores is enough.
    fn is_met(&self, success: usize, total: usize) -> bool;

    /// Whether the quorum can still be reached given `failure` failures so far.
    fn can_be_met(&self, failure: usize, total: usize) -> bool;
}

/// Strict-majority quorum: more than half of the stores must succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Majority;

impl QuorumStrategy for Majority {
    fn is_met(&self, success: usize, total: usize) -> bool {
        success * 2 > total
    }

    fn can_be_met(&self, failure: usize, total: usize) -> bool {
        failure * 2 < total
    }
}

/// Unanimous quorum: every store must succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unanimous;

impl QuorumStrategy for Unanimous {
    fn is_met(&self, success: usize, total: usize) -> bool {
        total > 0 && success == total
    }

    fn can_be_met(&self, failure: usize, _total: usize) -> bool {
        failure == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_is_met() {
        let strategy = Majority;
        assert!(strategy.is_met(2, 3));
        assert!(strategy.is_met(3, 3));
        assert!(!strategy.is_met(1, 3));
        // Even store count needs a strict majority
        assert!(!strategy.is_met(2, 4));
        assert!(strategy.is_met(3, 4));
    }

    #[test]
    fn test_majority_can_be_met() {
        let strategy = Majority;
        assert!(strategy.can_be_met(0, 3));
        assert!(strategy.can_be_met(1, 3));
        assert!(!strategy.can_be_met(2, 3));
        assert!(strategy.can_be_met(1, 4));
        assert!(!strategy.can_be_met(2, 4));
    }

    #[test]
    fn test_unanimous() {
        let strategy = Unanimous;
        assert!(strategy.is_met(3, 3));
        assert!(!strategy.is_met(2, 3));
        assert!(!strategy.is_met(0, 0));
        assert!(strategy.can_be_met(0, 3));
        assert!(!strategy.can_be_met(1, 3));
    }
}

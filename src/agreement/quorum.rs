//! Quorum arithmetic for the single-decree primitive
//!
//! `n` is the size of the round's leader set, `f` the number of faulty
//! nodes the vote thresholds are sized for. All vote checks are strictly
//! greater-than, matching the acceptance rules in
//! [`execution`](super::execution).

/// Vote thresholds for a leader set of `n` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    n: usize,
}

impl Quorum {
    pub fn new(n: usize) -> Self {
        Quorum { n }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Largest number of faulty nodes the thresholds are sized for:
    /// the greatest integer strictly below n/3.
    pub fn f(&self) -> usize {
        if self.n == 0 {
            return 0;
        }
        if self.n % 3 == 0 {
            self.n / 3 - 1
        } else {
            self.n / 3
        }
    }

    /// Votes needed (exclusive) to strong-accept: (n+f)/2.
    pub fn strong(&self) -> usize {
        (self.n + self.f()) / 2
    }

    /// Votes needed (exclusive) to decide from weak votes alone: (n+3f)/2.
    pub fn decide_weak(&self) -> usize {
        (self.n + 3 * self.f()) / 2
    }

    /// Votes needed (exclusive) to decide from strong votes: 2f.
    pub fn decide_strong(&self) -> usize {
        2 * self.f()
    }

    /// Minimum number (inclusive) of verified contributors for a cycle's
    /// result to be trusted: ceil(2n/3).
    pub fn two_thirds(&self) -> usize {
        (2 * self.n).div_ceil(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f_values() {
        assert_eq!(Quorum::new(3).f(), 0);
        assert_eq!(Quorum::new(4).f(), 1);
        assert_eq!(Quorum::new(6).f(), 1);
        assert_eq!(Quorum::new(7).f(), 2);
        assert_eq!(Quorum::new(10).f(), 3);
    }

    #[test]
    fn test_vote_thresholds() {
        let q = Quorum::new(4);
        assert_eq!(q.strong(), 2);
        assert_eq!(q.decide_weak(), 3);
        assert_eq!(q.decide_strong(), 2);

        let q = Quorum::new(7);
        assert_eq!(q.strong(), 4);
        assert_eq!(q.decide_weak(), 6);
        assert_eq!(q.decide_strong(), 4);
    }

    #[test]
    fn test_two_thirds() {
        assert_eq!(Quorum::new(3).two_thirds(), 2);
        assert_eq!(Quorum::new(4).two_thirds(), 3);
        assert_eq!(Quorum::new(6).two_thirds(), 4);
        assert_eq!(Quorum::new(7).two_thirds(), 5);
    }

    #[test]
    fn test_four_nodes_decide_despite_one_silent() {
        // With n=4, f=1 three live nodes must be able to decide through
        // the strong path: 3 > strong() and 3 > decide_strong().
        let q = Quorum::new(4);
        assert!(3 > q.strong());
        assert!(3 > q.decide_strong());
        assert!(3 <= q.decide_weak());
    }
}

//! Lock modes.
//!
//! Key locks are OKVL: one gap mode, one whole-key mode, and a small fixed
//! number of per-partition key modes selected by a hash of the value. The
//! components are orthogonal; two requests conflict only where the same
//! component (or a partition against the whole key) conflicts. Higher
//! levels of the hierarchy (volume, store) use classic intent modes.

/// Partitions per key lock.
pub const OKVL_PARTITIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBase {
    N,
    S,
    X,
}

impl LockBase {
    pub fn compatible(a: LockBase, b: LockBase) -> bool {
        match (a, b) {
            (LockBase::N, _) | (_, LockBase::N) => true,
            (LockBase::S, LockBase::S) => true,
            _ => false,
        }
    }

    pub fn supremum(a: LockBase, b: LockBase) -> LockBase {
        match (a, b) {
            (LockBase::X, _) | (_, LockBase::X) => LockBase::X,
            (LockBase::S, _) | (_, LockBase::S) => LockBase::S,
            _ => LockBase::N,
        }
    }

    pub fn implies(self, other: LockBase) -> bool {
        Self::supremum(self, other) == self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkvlMode {
    pub gap: LockBase,
    pub key: LockBase,
    pub partitions: [LockBase; OKVL_PARTITIONS],
}

impl OkvlMode {
    pub const EMPTY: OkvlMode = OkvlMode {
        gap: LockBase::N,
        key: LockBase::N,
        partitions: [LockBase::N; OKVL_PARTITIONS],
    };

    pub fn key_mode(key: LockBase) -> OkvlMode {
        OkvlMode {
            key,
            ..OkvlMode::EMPTY
        }
    }

    pub fn key_s() -> OkvlMode {
        Self::key_mode(LockBase::S)
    }

    pub fn key_x() -> OkvlMode {
        Self::key_mode(LockBase::X)
    }

    /// Gap-only lock on the open interval following the key.
    pub fn gap_mode(gap: LockBase) -> OkvlMode {
        OkvlMode {
            gap,
            ..OkvlMode::EMPTY
        }
    }

    /// Key + gap, as a ranged insert takes.
    pub fn key_gap(key: LockBase, gap: LockBase) -> OkvlMode {
        OkvlMode {
            gap,
            key,
            ..OkvlMode::EMPTY
        }
    }

    /// Lock one value partition of the key.
    pub fn partition_mode(partition: usize, mode: LockBase) -> OkvlMode {
        let mut m = OkvlMode::EMPTY;
        m.partitions[partition % OKVL_PARTITIONS] = mode;
        m
    }

    pub fn is_empty(&self) -> bool {
        *self == OkvlMode::EMPTY
    }

    pub fn is_compatible(&self, other: &OkvlMode) -> bool {
        if !LockBase::compatible(self.gap, other.gap) {
            return false;
        }
        if !LockBase::compatible(self.key, other.key) {
            return false;
        }
        for i in 0..OKVL_PARTITIONS {
            // a whole-key mode covers every partition
            if !LockBase::compatible(self.key, other.partitions[i])
                || !LockBase::compatible(self.partitions[i], other.key)
                || !LockBase::compatible(self.partitions[i], other.partitions[i])
            {
                return false;
            }
        }
        true
    }

    pub fn combine(&self, other: &OkvlMode) -> OkvlMode {
        let mut partitions = [LockBase::N; OKVL_PARTITIONS];
        for i in 0..OKVL_PARTITIONS {
            partitions[i] = LockBase::supremum(self.partitions[i], other.partitions[i]);
        }
        OkvlMode {
            gap: LockBase::supremum(self.gap, other.gap),
            key: LockBase::supremum(self.key, other.key),
            partitions,
        }
    }

    /// Does this request read or write anything (for ELR-S release rules)?
    pub fn is_read_only(&self) -> bool {
        let mut writes = self.key == LockBase::X || self.gap == LockBase::X;
        for p in &self.partitions {
            writes |= *p == LockBase::X;
        }
        !writes
    }

    /// The weakest intent mode an ancestor must hold for this key lock.
    pub fn intent_counterpart(&self) -> IntentMode {
        if self.is_read_only() {
            IntentMode::IS
        } else {
            IntentMode::IX
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentMode {
    N,
    IS,
    IX,
    S,
    SIX,
    X,
}

impl IntentMode {
    pub fn compatible(a: IntentMode, b: IntentMode) -> bool {
        use IntentMode::*;
        match (a, b) {
            (N, _) | (_, N) => true,
            (IS, X) | (X, IS) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) => true,
            (IX, _) | (_, IX) => false,
            (S, S) => true,
            (S, _) | (_, S) => false,
            _ => false, // SIX-SIX, SIX-X, X-anything
        }
    }

    pub fn supremum(a: IntentMode, b: IntentMode) -> IntentMode {
        use IntentMode::*;
        if a == b {
            return a;
        }
        match (a, b) {
            (N, m) | (m, N) => m,
            (X, _) | (_, X) => X,
            (SIX, _) | (_, SIX) => SIX,
            (S, IX) | (IX, S) => SIX,
            (S, IS) | (IS, S) => S,
            (IX, IS) | (IS, IX) => IX,
            _ => X,
        }
    }

    /// `self` grants at least the rights of `other`.
    pub fn implies(self, other: IntentMode) -> bool {
        Self::supremum(self, other) == self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_compat() {
        assert!(LockBase::compatible(LockBase::S, LockBase::S));
        assert!(!LockBase::compatible(LockBase::S, LockBase::X));
        assert!(!LockBase::compatible(LockBase::X, LockBase::X));
        assert!(LockBase::compatible(LockBase::N, LockBase::X));
    }

    #[test]
    fn test_okvl_orthogonality() {
        // gap-S with key-X coexists with key-S only if components agree
        let gap_s = OkvlMode::gap_mode(LockBase::S);
        let key_x = OkvlMode::key_x();
        assert!(gap_s.is_compatible(&key_x));

        let key_s = OkvlMode::key_s();
        assert!(!key_s.is_compatible(&key_x));
        assert!(key_s.is_compatible(&key_s));

        // disjoint partitions do not conflict
        let p0 = OkvlMode::partition_mode(0, LockBase::X);
        let p1 = OkvlMode::partition_mode(1, LockBase::X);
        assert!(p0.is_compatible(&p1));
        assert!(!p0.is_compatible(&p0));

        // a whole-key X covers every partition
        assert!(!key_x.is_compatible(&p1));
    }

    #[test]
    fn test_okvl_combine() {
        let a = OkvlMode::key_gap(LockBase::S, LockBase::S);
        let b = OkvlMode::key_x();
        let c = a.combine(&b);
        assert_eq!(c.key, LockBase::X);
        assert_eq!(c.gap, LockBase::S);
    }

    #[test]
    fn test_intent_matrix() {
        use IntentMode::*;
        assert!(IntentMode::compatible(IS, IX));
        assert!(IntentMode::compatible(IX, IX));
        assert!(!IntentMode::compatible(IX, S));
        assert!(IntentMode::compatible(IS, S));
        assert!(!IntentMode::compatible(S, SIX));
        assert!(IntentMode::compatible(IS, SIX));
        assert!(!IntentMode::compatible(X, IS));
    }

    #[test]
    fn test_intent_supremum() {
        use IntentMode::*;
        assert_eq!(IntentMode::supremum(S, IX), SIX);
        assert_eq!(IntentMode::supremum(IS, IX), IX);
        assert_eq!(IntentMode::supremum(N, S), S);
        assert!(SIX.implies(IX));
        assert!(SIX.implies(S));
        assert!(!IX.implies(S));
    }
}

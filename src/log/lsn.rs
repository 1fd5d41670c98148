use std::fmt;

/// Log sequence number: the high 32 bits name the partition (file), the low
/// 32 bits are the byte offset within it. Total order falls out of the
/// packing. Zero is the null LSN and sorts below every valid one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    pub const NULL: Lsn = Lsn(0);

    pub fn new(partition: u32, offset: u32) -> Self {
        Lsn(((partition as u64) << 32) | offset as u64)
    }

    pub fn from_u64(v: u64) -> Self {
        Lsn(v)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn partition(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The position `bytes` after this one in the same partition.
    pub fn advance(self, bytes: u32) -> Lsn {
        debug_assert!(!self.is_null());
        Lsn::new(self.partition(), self.offset() + bytes)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "lsn<null>")
        } else {
            write!(f, "lsn<{}.{}>", self.partition(), self.offset())
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::Lsn;

    #[test]
    fn test_order() {
        assert!(Lsn::NULL < Lsn::new(1, 0));
        assert!(Lsn::new(1, 100) < Lsn::new(1, 101));
        assert!(Lsn::new(1, u32::MAX) < Lsn::new(2, 0));
    }

    #[test]
    fn test_advance() {
        let l = Lsn::new(3, 16);
        assert_eq!(l.advance(8), Lsn::new(3, 24));
        assert_eq!(l.partition(), 3);
        assert_eq!(l.advance(8).offset(), 24);
    }
}

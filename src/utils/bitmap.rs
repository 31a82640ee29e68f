//! Fixed-size set of process IDs, used for per-process flags such as
//! liveness hints and lock contention.

use std::fmt;

use crate::utils::LendsetError;

use fixedbitset::FixedBitSet;

/// One flag per process ID in `0..size`. The size never changes.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a bitmap for `size` processes with every flag set to `init`.
    ///
    /// Panics if `size` is zero: a cluster always contains at least me.
    pub fn new(size: u8, init: bool) -> Self {
        assert!(size > 0, "invalid bitmap size {}", size);
        let mut bits = FixedBitSet::with_capacity(size as usize);
        bits.set_range(.., init);
        Bitmap(bits)
    }

    fn check(&self, pid: u8) -> Result<usize, LendsetError> {
        let idx = pid as usize;
        if idx < self.0.len() {
            Ok(idx)
        } else {
            Err(LendsetError::msg(format!(
                "process {} outside bitmap of {}",
                pid,
                self.0.len()
            )))
        }
    }

    /// Sets the flag of `pid`.
    #[inline]
    pub fn set(&mut self, pid: u8, flag: bool) -> Result<(), LendsetError> {
        let idx = self.check(pid)?;
        self.0.set(idx, flag);
        Ok(())
    }

    /// Reads the flag of `pid`.
    #[inline]
    pub fn get(&self, pid: u8) -> Result<bool, LendsetError> {
        let idx = self.check(pid)?;
        Ok(self.0.contains(idx))
    }

    /// Number of processes covered.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Number of flags set.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Yields `(pid, flag)` for every process in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        (0..self.0.len()).map(|idx| (idx as u8, self.0.contains(idx)))
    }

    /// Yields the IDs whose flag is set.
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.ones().map(|idx| idx as u8)
    }
}

// prints as `{size; [set ids]}`
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; ", self.size())?;
        f.debug_list().entries(self.ones()).finish()?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn empty_cluster() {
        Bitmap::new(0, true);
    }

    #[test]
    fn flags_in_range() -> Result<(), LendsetError> {
        let mut live = Bitmap::new(3, true);
        assert_eq!(live.count(), 3);
        live.set(1, false)?;
        assert_eq!(live.get(1), Ok(false));
        assert_eq!(live.get(2), Ok(true));
        assert_eq!(live.count(), 2);
        assert!(live.set(3, true).is_err());
        assert!(live.get(3).is_err());
        Ok(())
    }

    #[test]
    fn iterate_flags() -> Result<(), LendsetError> {
        let mut requesting = Bitmap::new(4, false);
        requesting.set(0, true)?;
        requesting.set(3, true)?;
        assert_eq!(
            requesting.iter().collect::<Vec<_>>(),
            vec![(0, true), (1, false), (2, false), (3, true)]
        );
        assert_eq!(requesting.ones().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(format!("{:?}", requesting), "{4; [0, 3]}");
        Ok(())
    }
}

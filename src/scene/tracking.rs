//! Change tracking guards.
//!
//! Mutable access to tracked state goes through a guard that records the
//! change when it is dropped, so callers cannot forget to mark it.

use std::ops::{Deref, DerefMut};

use super::node::NodeFlags;

/// Marks `flag` on the owning node when dropped.
pub struct DirtyGuard<'a, T> {
    data: &'a mut T,
    flags: &'a mut NodeFlags,
    flag: NodeFlags,
}

impl<'a, T> DirtyGuard<'a, T> {
    pub(crate) fn new(data: &'a mut T, flags: &'a mut NodeFlags, flag: NodeFlags) -> Self {
        Self { data, flags, flag }
    }
}

impl<T> Deref for DirtyGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> DerefMut for DirtyGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for DirtyGuard<'_, T> {
    fn drop(&mut self) {
        self.flags.insert(self.flag);
    }
}

/// Bumps a version counter when dropped. Used for data objects whose
/// payload can be replaced without changing their cache identity.
pub struct VersionGuard<'a, T> {
    data: &'a mut T,
    version: &'a mut u64,
}

impl<'a, T> VersionGuard<'a, T> {
    pub(crate) fn new(data: &'a mut T, version: &'a mut u64) -> Self {
        Self { data, version }
    }
}

impl<T> Deref for VersionGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> DerefMut for VersionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for VersionGuard<'_, T> {
    fn drop(&mut self) {
        *self.version = self.version.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_guard_marks_on_drop() {
        let mut value = 1.0f32;
        let mut flags = NodeFlags::empty();
        {
            let mut guard = DirtyGuard::new(&mut value, &mut flags, NodeFlags::TRANSFORM_DIRTY);
            *guard = 2.0;
        }
        assert_eq!(value, 2.0);
        assert!(flags.contains(NodeFlags::TRANSFORM_DIRTY));
    }

    #[test]
    fn test_version_guard_bumps() {
        let mut data = vec![0u8; 4];
        let mut version = 7;
        VersionGuard::new(&mut data, &mut version)[0] = 9;
        assert_eq!(version, 8);
        assert_eq!(data[0], 9);
    }
}

//! Anchor change tracking.
//!
//! An anchor is whatever small piece of persistent state a container keeps
//! at a fixed, well-known location (a master block, or a field within one).
//! An [`AnchorHandle`] pairs a mutable reference to that state with an
//! optional change flag, so a container can mark its owning master block
//! dirty exactly when the anchor was actually touched, without forcing
//! every read of the anchor to pay for a dirty-block round trip.

/// A mutable reference to an anchor value, plus an optional flag that is
/// set whenever the value is mutated through [`AnchorHandle::get_mut`].
///
/// Read-only access never sets the flag; only [`get_mut`](Self::get_mut)
/// does, on the assumption that a caller asking for a mutable reference
/// intends to use it.
pub struct AnchorHandle<'a, T> {
    value: &'a mut T,
    changed: Option<&'a mut bool>,
}

impl<'a, T> AnchorHandle<'a, T> {
    /// Wraps `value` with no change tracking: mutations are silent.
    pub fn new(value: &'a mut T) -> Self {
        AnchorHandle {
            value,
            changed: None,
        }
    }

    /// Wraps `value`, setting `*changed = true` on every mutable access.
    pub fn tracked(value: &'a mut T, changed: &'a mut bool) -> Self {
        AnchorHandle {
            value,
            changed: Some(changed),
        }
    }

    /// Read-only access to the anchor value.
    pub fn get(&self) -> &T {
        self.value
    }

    /// Mutable access to the anchor value. Marks the change flag, if any,
    /// regardless of whether the caller actually ends up writing through
    /// the reference.
    pub fn get_mut(&mut self) -> &mut T {
        if let Some(flag) = self.changed.as_mut() {
            **flag = true;
        }
        self.value
    }

    /// Whether a mutable access has been handed out since this handle (or
    /// its tracked flag) was created.
    pub fn is_changed(&self) -> bool {
        self.changed.as_deref().copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_mutation_is_silent() {
        let mut value = 1u32;
        let mut handle = AnchorHandle::new(&mut value);
        *handle.get_mut() = 2;
        assert_eq!(*handle.get(), 2);
    }

    #[test]
    fn tracked_mutation_sets_flag() {
        let mut value = 1u32;
        let mut changed = false;
        {
            let mut handle = AnchorHandle::tracked(&mut value, &mut changed);
            assert!(!handle.is_changed());
            *handle.get_mut() += 1;
            assert!(handle.is_changed());
        }
        assert!(changed);
        assert_eq!(value, 2);
    }
}

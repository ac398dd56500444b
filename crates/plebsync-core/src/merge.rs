//! Merge rules for partial snapshots
//!
//! Live updates routinely arrive incomplete: a comment update may carry vote
//! counts but no reply pages, a subplebbit update may omit its role map.
//! Merging keeps every field the newer snapshot does not carry, so a sparse
//! payload never erases a known-good value.
//!
//! Both directions are needed:
//!  - `merge`: newer fields win (applying a live update)
//!  - `fill_missing`: local fields win (adopting a fetched copy of our own
//!    publication without clobbering what we published)

/// Field-wise merge of snapshots whose fields are mostly optional.
pub trait Merge: Clone {
    /// Merge `newer` on top of `self`. Fields present in `newer` win.
    fn merge(&self, newer: &Self) -> Self;

    /// Fill fields absent in `self` from `other`. Fields already known win.
    fn fill_missing(&self, other: &Self) -> Self {
        other.merge(self)
    }

    /// Merge-assign: `self = self.merge(newer)`
    fn merge_assign(&mut self, newer: &Self) {
        *self = self.merge(newer);
    }
}

/// Newer value if present, otherwise the older one.
pub fn newer_or<T: Clone>(older: &Option<T>, newer: &Option<T>) -> Option<T> {
    newer.clone().or_else(|| older.clone())
}

impl<T: Merge> Merge for Option<T> {
    fn merge(&self, newer: &Self) -> Self {
        match (self, newer) {
            (Some(older), Some(newer)) => Some(older.merge(newer)),
            (None, Some(newer)) => Some(newer.clone()),
            (older, None) => older.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Counts {
        up: Option<u64>,
        down: Option<u64>,
    }

    impl Merge for Counts {
        fn merge(&self, newer: &Self) -> Self {
            Self {
                up: newer_or(&self.up, &newer.up),
                down: newer_or(&self.down, &newer.down),
            }
        }
    }

    #[test]
    fn test_newer_fields_win() {
        let older = Counts { up: Some(1), down: Some(2) };
        let newer = Counts { up: Some(5), down: None };

        assert_eq!(older.merge(&newer), Counts { up: Some(5), down: Some(2) });
    }

    #[test]
    fn test_fill_missing_prefers_local() {
        let local = Counts { up: Some(1), down: None };
        let fetched = Counts { up: Some(9), down: Some(3) };

        assert_eq!(local.fill_missing(&fetched), Counts { up: Some(1), down: Some(3) });
    }

    #[test]
    fn test_option_merge() {
        let none: Option<Counts> = None;
        let some = Some(Counts { up: Some(1), down: None });

        assert_eq!(none.merge(&some), some);
        assert_eq!(some.merge(&None), some);
    }
}

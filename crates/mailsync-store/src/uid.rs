//! Message UID helpers.
//!
//! Server UIDs are opaque strings. Messages created locally carry a
//! placeholder UID with [`LOCAL_UID_PREFIX`] until they are uploaded and the
//! server assigns a real one.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::OnceLock;

/// Prefix marking a UID that has not been assigned by a server.
pub const LOCAL_UID_PREFIX: &str = "mailsync-local:";

/// Returns true if the UID is a local placeholder.
#[must_use]
pub fn is_local(uid: &str) -> bool {
    uid.starts_with(LOCAL_UID_PREFIX)
}

/// Generates a fresh local placeholder UID.
///
/// UIDs are unique for the lifetime of the process and increase
/// monotonically, seeded from the wall clock so restarts do not collide.
#[must_use]
pub fn new_local() -> String {
    static NEXT: OnceLock<AtomicU64> = OnceLock::new();
    let seed = || {
        let millis = chrono::Utc::now().timestamp_millis();
        AtomicU64::new(u64::try_from(millis).unwrap_or_default())
    };
    let n = NEXT.get_or_init(seed).fetch_add(1, AtomicOrdering::Relaxed);
    format!("{LOCAL_UID_PREFIX}{n}")
}

/// Parses a UID as a number, if it is one.
#[must_use]
pub fn numeric(uid: &str) -> Option<u64> {
    uid.parse().ok()
}

/// Orders UIDs newest first.
///
/// Numeric UIDs come first, highest value first. Non-numeric UIDs sort
/// after every numeric one, ordered by their string value.
#[must_use]
pub fn newest_first(a: &str, b: &str) -> Ordering {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Sorts items newest first using [`newest_first`] on the extracted UID.
pub fn sort_newest_first<T>(items: &mut [T], uid: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| newest_first(uid(a), uid(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_local_uids_are_unique_and_marked() {
        let a = new_local();
        let b = new_local();
        assert_ne!(a, b);
        assert!(is_local(&a));
        assert!(!is_local("1234"));
    }

    #[test]
    fn test_numeric_ordering() {
        let mut uids = vec!["2", "10", "1", "33"];
        sort_newest_first(&mut uids, |u| u);
        assert_eq!(uids, vec!["33", "10", "2", "1"]);
    }

    #[test]
    fn test_non_numeric_sorts_after_numeric() {
        let mut uids = vec!["b", "7", "a", "12", "mailsync-local:3", "c"];
        sort_newest_first(&mut uids, |u| u);
        assert_eq!(uids, vec!["12", "7", "a", "b", "c", "mailsync-local:3"]);
    }

    #[test]
    fn test_leading_zeros_order_deterministically() {
        assert_eq!(newest_first("07", "7"), Ordering::Less);
        assert_eq!(newest_first("7", "07"), Ordering::Greater);
        assert_eq!(newest_first("7", "7"), Ordering::Equal);
    }

    fn mixed_uid() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u64..200).prop_map(|n| n.to_string()),
            "[a-z]{1,3}",
        ]
    }

    proptest! {
        #[test]
        fn test_mixed_uids_sort_numeric_newest_first(
            mut uids in prop::collection::vec(mixed_uid(), 0..60),
        ) {
            sort_newest_first(&mut uids, String::as_str);

            let split = uids.iter().position(|u| numeric(u).is_none()).unwrap_or(uids.len());
            let (numbers, words) = uids.split_at(split);
            prop_assert!(words.iter().all(|u| numeric(u).is_none()));
            prop_assert!(numbers
                .windows(2)
                .all(|w| numeric(&w[0]) >= numeric(&w[1])));
            prop_assert!(words.windows(2).all(|w| w[0] <= w[1]));
        }

        #[test]
        fn test_comparator_is_transitive(
            a in mixed_uid(),
            b in mixed_uid(),
            c in mixed_uid(),
        ) {
            if newest_first(&a, &b) != Ordering::Greater
                && newest_first(&b, &c) != Ordering::Greater
            {
                prop_assert_ne!(newest_first(&a, &c), Ordering::Greater);
            }
            prop_assert_eq!(newest_first(&a, &b), newest_first(&b, &a).reverse());
        }
    }
}

//! Set arithmetic on the keys of the source and destination buckets
use itertools::{Either, Itertools};
use std::collections::HashSet;

/// How the keys of a backup split up between the stages
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct BackupPlan {
    /// Keys only in the source
    pub to_copy: Vec<String>,

    /// Keys in both buckets, which may or may not need copying
    pub to_compare: Vec<String>,

    /// Keys only in the destination, which were deleted from the source
    pub to_tag: Vec<String>,
}

impl BackupPlan {
    /// Partition the keys into copy and compare candidates.  `to_copy` and `to_compare` together
    /// contain every source key exactly once.
    pub(crate) fn new(source: Vec<String>, destination: Vec<String>) -> Self {
        let source_set: HashSet<&str> = source.iter().map(String::as_str).collect();

        let to_tag = destination
            .iter()
            .filter(|key| !source_set.contains(key.as_str()))
            .cloned()
            .collect();

        let destination: HashSet<String> = destination.into_iter().collect();

        let (to_compare, to_copy) = source
            .into_iter()
            .unique()
            .partition_map(|key| {
                if destination.contains(&key) {
                    Either::Left(key)
                } else {
                    Either::Right(key)
                }
            });

        Self {
            to_copy,
            to_compare,
            to_tag,
        }
    }

    /// Full copy: every source key is copied, nothing is compared and nothing is tagged
    pub(crate) fn copy_all(source: Vec<String>) -> Self {
        Self {
            to_copy: source.into_iter().unique().collect(),
            ..Default::default()
        }
    }
}

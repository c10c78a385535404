//! Backups between in-memory buckets
use super::{test_config, MemoryObject, MemoryStore};
use crate::Result;
use assert_matches::assert_matches;
use s3br::{BackupJobBuilder, ErrorKind, S3BrError};

/// Source `{a, b, c}` and destination `{b, c, d}`, where `b` is identical in both and `c` differs
/// in size
fn overlapping_buckets() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_bucket("source");
    store.create_bucket("backup");

    store.put("source", "a", MemoryObject::old(10, "\"a\""));
    store.put("source", "b", MemoryObject::old(20, "\"b\""));
    store.put("source", "c", MemoryObject::old(31, "\"c2\""));

    store.put("backup", "b", MemoryObject::old(20, "\"b\""));
    store.put("backup", "c", MemoryObject::old(30, "\"c\""));
    store.put("backup", "d", MemoryObject::old(40, "\"d\""));

    store
}

#[test]
fn incremental_backup_copies_only_changes() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();

        let job = BackupJobBuilder::new(
            test_config(),
            store.bucket("source"),
            store.bucket("backup"),
        )
        .build()
        .await?;

        assert_eq!(1, job.objects_to_copy());
        assert_eq!(2, job.objects_to_compare());
        assert_eq!(1, job.objects_to_tag());

        let summary = job.run(futures::future::pending()).await?;

        assert_eq!(3, summary.source_objects);
        assert_eq!(1, summary.compare.forwarded);
        assert_eq!(1, summary.compare.skipped);
        assert_eq!(2, summary.copied());
        assert_eq!(None, summary.tag_deleted);

        assert_eq!(1, store.calls("CopyObject", "a"));
        assert_eq!(0, store.calls("CopyObject", "b"));
        assert_eq!(1, store.calls("CopyObject", "c"));

        assert_eq!(vec!["a", "b", "c", "d"], store.keys("backup"));
        assert_eq!(31, store.get("backup", "c").unwrap().size);

        // Not tagging, so `d` is left alone
        assert!(store.get("backup", "d").unwrap().tags.is_empty());

        Ok(())
    })
}

#[test]
fn tag_deleted_is_idempotent() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();

        for run in 0..2 {
            let summary = BackupJobBuilder::new(
                test_config(),
                store.bucket("source"),
                store.bucket("backup"),
            )
            .tag_deleted(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

            let expected_tagged = if run == 0 { 1 } else { 0 };
            assert_eq!(expected_tagged, summary.tagged_deleted(), "run {run}");
        }

        let tags = store.get("backup", "d").unwrap().tags;
        assert_eq!(Some("True"), tags.get("Deleted").map(String::as_str));
        assert!(tags.contains_key("DeletedAt"));

        assert_eq!(1, store.calls("PutObjectTagging", "d"));
        assert_eq!(2, store.calls("GetObjectTagging", "d"));

        Ok(())
    })
}

#[test]
fn copy_all_skips_comparison() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();

        let summary = BackupJobBuilder::new(
            test_config(),
            store.bucket("source"),
            store.bucket("backup"),
        )
        .all(true)
        .tag_deleted(true)
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(3, summary.copied());
        assert_eq!(0, store.calls("HeadObject", "b"));
        assert_eq!(1, store.calls("CopyObject", "b"));

        // Tagging needs the destination listing, which full copies don't do
        assert_eq!(None, summary.tag_deleted);

        Ok(())
    })
}

#[test]
fn failed_copies_are_retried_until_they_succeed() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();

        store.fail(
            "CopyObject",
            "a",
            [
                ErrorKind::Throttled,
                ErrorKind::Transient,
                ErrorKind::Unclassified,
            ],
        );
        store.fail("HeadObject", "b", [ErrorKind::Transient]);

        let summary = BackupJobBuilder::new(
            test_config(),
            store.bucket("source"),
            store.bucket("backup"),
        )
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(3, summary.copy.failed);
        assert_eq!(1, summary.compare.failed);
        assert_eq!(0, summary.copy.abandoned);
        assert_eq!(2, summary.copied());

        // Exactly one successful copy, no matter how many attempts failed
        assert_eq!(1, store.calls("CopyObject", "a"));

        Ok(())
    })
}

#[test]
fn max_attempts_gives_up_on_hopeless_objects() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();
        store.fail("CopyObject", "a", std::iter::repeat(ErrorKind::Unclassified).take(100));

        let mut config = test_config();
        config.max_attempts = Some(4);

        let summary = BackupJobBuilder::new(config, store.bucket("source"), store.bucket("backup"))
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(1, summary.copy.abandoned);
        assert_eq!(1, summary.abandoned());
        assert_eq!(3, summary.copy.failed);
        assert_eq!(1, summary.copied());
        assert!(store.get("backup", "a").is_none());

        Ok(())
    })
}

#[test]
fn abandoned_tags_are_counted() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();
        store.fail("PutObjectTagging", "d", std::iter::repeat(ErrorKind::Unclassified).take(100));

        let mut config = test_config();
        config.max_attempts = Some(2);

        let summary = BackupJobBuilder::new(config, store.bucket("source"), store.bucket("backup"))
            .tag_deleted(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(0, summary.tagged_deleted());
        assert_eq!(Some(1), summary.tag_deleted.map(|report| report.abandoned));
        assert_eq!(1, summary.abandoned());
        assert!(store.get("backup", "d").unwrap().tags.is_empty());

        Ok(())
    })
}

#[test]
fn objects_count_truncates_listing_and_skips_tagging() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = MemoryStore::new();
        store.create_bucket("source");
        store.create_bucket("backup");

        for i in 0..1000 {
            store.put("source", &format!("key-{i:04}"), MemoryObject::old(1, "\"x\""));
        }
        store.put("backup", "stale", MemoryObject::old(1, "\"x\""));

        let mut config = test_config();
        config.objects_count = Some(5);

        let summary = BackupJobBuilder::new(config, store.bucket("source"), store.bucket("backup"))
            .tag_deleted(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(5, summary.source_objects);
        assert_eq!(5, summary.copied());
        assert_eq!(None, summary.tag_deleted);
        assert!(store.get("backup", "stale").unwrap().tags.is_empty());

        Ok(())
    })
}

#[test]
fn prefix_limits_backup() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = MemoryStore::new();
        store.create_bucket("source");
        store.create_bucket("backup");

        store.put("source", "logs/1", MemoryObject::old(1, "\"1\""));
        store.put("source", "logs/2", MemoryObject::old(1, "\"2\""));
        store.put("source", "data/1", MemoryObject::old(1, "\"3\""));
        store.put("backup", "data/old", MemoryObject::old(1, "\"4\""));

        let mut config = test_config();
        config.prefix = Some("logs/".to_string());

        let summary = BackupJobBuilder::new(config, store.bucket("source"), store.bucket("backup"))
            .tag_deleted(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(2, summary.copied());
        assert_eq!(0, summary.tagged_deleted());
        assert_eq!(vec!["data/old", "logs/1", "logs/2"], store.keys("backup"));

        Ok(())
    })
}

#[test]
fn listing_failure_is_fatal() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();
        store.fail("ListObjectsV2", "backup", [ErrorKind::Unclassified]);

        let result = BackupJobBuilder::new(
            test_config(),
            store.bucket("source"),
            store.bucket("backup"),
        )
        .build()
        .await;

        assert_matches!(result, Err(S3BrError::ListKeys { bucket, .. }) if bucket == "backup");

        Ok(())
    })
}

#[test]
fn abort_interrupts_backup() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = overlapping_buckets();

        // Keep `a` failing for much longer than the abort takes
        store.fail("CopyObject", "a", std::iter::repeat(ErrorKind::Transient).take(10_000));

        let job = BackupJobBuilder::new(
            test_config(),
            store.bucket("source"),
            store.bucket("backup"),
        )
        .build()
        .await?;

        let result = job
            .run(tokio::time::sleep(std::time::Duration::from_millis(200)))
            .await;

        assert_matches!(result, Err(S3BrError::Interrupted));

        Ok(())
    })
}

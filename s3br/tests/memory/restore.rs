//! Restores from in-memory backup buckets
use super::{test_config, MemoryObject, MemoryStore};
use crate::Result;
use assert_matches::assert_matches;
use s3br::{ErrorKind, RestoreJobBuilder, S3BrError};

fn backup_with_deleted_object() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_bucket("backup");
    store.create_bucket("restored");

    store.put("backup", "kept", MemoryObject::old(10, "\"kept\""));

    let mut deleted = MemoryObject::old(20, "\"deleted\"");
    deleted
        .tags
        .insert("Deleted".to_string(), "True".to_string());
    deleted
        .tags
        .insert("DeletedAt".to_string(), "2023-01-01T00:00:00".to_string());
    store.put("backup", "deleted", deleted);

    store
}

#[test]
fn restore_everything() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = backup_with_deleted_object();

        let summary = RestoreJobBuilder::new(
            test_config(),
            store.bucket("backup"),
            store.bucket("restored"),
        )
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(2, summary.restored());
        assert_eq!(None, summary.check_deleted_tag);
        assert_eq!(vec!["deleted", "kept"], store.keys("restored"));

        Ok(())
    })
}

#[test]
fn check_deleted_tag_skips_deleted_objects() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = backup_with_deleted_object();

        let summary = RestoreJobBuilder::new(
            test_config(),
            store.bucket("backup"),
            store.bucket("restored"),
        )
        .check_deleted_tag(true)
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(1, summary.restored());
        assert_eq!(1, summary.skipped_deleted());
        assert_eq!(vec!["kept"], store.keys("restored"));

        Ok(())
    })
}

#[test]
fn abandoned_tag_checks_are_counted() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = backup_with_deleted_object();
        store.fail("GetObjectTagging", "kept", std::iter::repeat(ErrorKind::Unclassified).take(100));

        let mut config = test_config();
        config.max_attempts = Some(2);

        let summary = RestoreJobBuilder::new(config, store.bucket("backup"), store.bucket("restored"))
            .check_deleted_tag(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(0, summary.restored());
        assert_eq!(1, summary.skipped_deleted());
        assert_eq!(1, summary.abandoned());
        assert!(store.keys("restored").is_empty());

        Ok(())
    })
}

#[test]
fn all_overrides_check_deleted_tag() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = backup_with_deleted_object();

        let summary = RestoreJobBuilder::new(
            test_config(),
            store.bucket("backup"),
            store.bucket("restored"),
        )
        .check_deleted_tag(true)
        .all(true)
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(2, summary.restored());
        assert_eq!(0, store.calls("GetObjectTagging", "deleted"));

        Ok(())
    })
}

#[test]
fn archived_objects_are_copied_once_thawed() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = MemoryStore::new();
        store.create_bucket("backup");
        store.create_bucket("restored");

        store.put("backup", "frozen", MemoryObject::thawing(10, 3));
        store.put("backup", "warm", MemoryObject::old(10, "\"warm\""));

        let summary = RestoreJobBuilder::new(
            test_config(),
            store.bucket("backup"),
            store.bucket("restored"),
        )
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(2, summary.restored());
        assert_eq!(3, summary.restore.deferred);

        // Copying a thawing object fails, so no failures means no copy was attempted too early
        assert_eq!(0, summary.restore.failed);
        assert_eq!(1, store.calls("CopyObject", "frozen"));
        assert_eq!(4, store.calls("HeadObject", "frozen"));

        Ok(())
    })
}

#[test]
fn waits_for_destination_bucket() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = backup_with_deleted_object();
        store.create_bucket_after("late", 3);

        let summary = RestoreJobBuilder::new(
            test_config(),
            store.bucket("backup"),
            store.bucket("late"),
        )
        .build()
        .await?
        .run(futures::future::pending())
        .await?;

        assert_eq!(2, summary.restored());
        assert!(store.bucket_exists("late"));
        assert_eq!(4, store.calls("HeadBucket", "late"));

        Ok(())
    })
}

#[test]
fn missing_destination_bucket_is_fatal() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let store = backup_with_deleted_object();

        let mut config = test_config();
        config.bucket_wait_cycles = 2;
        config.bucket_wait_attempts = 3;

        let result = RestoreJobBuilder::new(config, store.bucket("backup"), store.bucket("never"))
            .build()
            .await?
            .run(futures::future::pending())
            .await;

        assert_matches!(
            result,
            Err(S3BrError::DestinationBucketMissing { bucket, cycles: 2 }) if bucket == "never"
        );
        assert_eq!(6, store.calls("HeadBucket", "never"));
        assert!(store.keys("never").is_empty());

        Ok(())
    })
}

//! Tests against a real minio server.
//!
//! These need the `minio` binary in the `PATH`, so they're ignored by default.  Run them with
//! `cargo test -- --ignored`.
use crate::Result;
use aws_sdk_s3::types::{Tag, Tagging};
use s3br::{BackupJobBuilder, ObjectStorageFactory, PurgeJob, RestoreJobBuilder};
use s3br_testing::minio::{self, MinioServer};
use s3br_testing::test_data::{self, TestObject};
use std::sync::Arc;

/// Config pointing at the minio server, with short waits so retries are quick
fn config_for_minio(server: &MinioServer) -> s3br::Config {
    let mut config = s3br::Config::default();

    config.aws_region = Some(minio::REGION.to_string());
    config.aws_access_key_id = Some(minio::ACCESS_KEY_ID.to_string());
    config.aws_secret_access_key = Some(minio::SECRET_ACCESS_KEY.to_string());
    config.s3_endpoint = Some(server.endpoint_url());
    config.disable_metrics = true;
    config.backoff_unit_ms = 10;
    config.max_wait = 100;
    config.poll_interval_ms = 50;
    config.slow_poll_interval_ms = 50;
    config.bucket_wait_delay_ms = 100;

    config
}

async fn factory(server: &Arc<MinioServer>) -> Result<ObjectStorageFactory> {
    Ok(ObjectStorageFactory::new(config_for_minio(server)).await?)
}

#[test]
#[ignore = "requires minio"]
fn backup_then_tag_deleted() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let server = MinioServer::get().await?;
        let client = server.aws_client().await?;
        let source = server.create_bucket("backup-source", false).await?;
        let backup = server.create_bucket("backup-destination", false).await?;

        let test_data = test_data::make_test_data(
            &client,
            &source,
            vec![
                TestObject::new("a.txt", "10KiB"),
                TestObject::new("dir/b.bin", "1MiB"),
                TestObject::new("dir/sub dir/c+d.bin", "100B"),
                TestObject::new("empty", "0B"),
            ],
        )
        .await?;

        let factory = factory(&server).await?;
        let config = config_for_minio(&server);

        let summary = BackupJobBuilder::from_factory(&factory, config.clone(), &source, &backup)
            .await?
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(4, summary.copied());
        test_data::validate_copies(
            &client,
            &backup,
            &test_data,
            test_data.keys().map(String::as_str),
        )
        .await?;

        client
            .delete_object()
            .bucket(&source)
            .key("a.txt")
            .send()
            .await?;

        let summary = BackupJobBuilder::from_factory(&factory, config, &source, &backup)
            .await?
            .tag_deleted(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(1, summary.tagged_deleted());

        // The deleted object stays in the backup, only tagged
        let tags = test_data::get_tags(&client, &backup, "a.txt").await?;
        assert_eq!(Some("True"), tags.get("Deleted").map(String::as_str));
        assert!(tags.contains_key("DeletedAt"));

        let tags = test_data::get_tags(&client, &backup, "dir/b.bin").await?;
        assert!(tags.is_empty());

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn large_objects_are_copied_in_parts() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let server = MinioServer::get().await?;
        let client = server.aws_client().await?;
        let source = server.create_bucket("multipart-source", false).await?;
        let backup = server.create_bucket("multipart-destination", false).await?;

        let test_data = test_data::make_test_data(
            &client,
            &source,
            vec![
                TestObject::new("small", "1MiB"),
                TestObject::new("large", "12MiB"),
            ],
        )
        .await?;

        // S3 requires every part except the last to be at least 5MiB
        let mut config = config_for_minio(&server);
        config.multipart_threshold = byte_unit::Byte::from_bytes(5 * 1024 * 1024);
        config.multipart_chunk_size = byte_unit::Byte::from_bytes(5 * 1024 * 1024);

        let factory = ObjectStorageFactory::new(config.clone()).await?;

        let summary = BackupJobBuilder::from_factory(&factory, config, &source, &backup)
            .await?
            .all(true)
            .build()
            .await?
            .run(futures::future::pending())
            .await?;

        assert_eq!(2, summary.copied());
        test_data::validate_copies(&client, &backup, &test_data, ["small", "large"]).await?;

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn restore_skips_deleted_objects() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let server = MinioServer::get().await?;
        let client = server.aws_client().await?;
        let backup = server.create_bucket("restore-source", false).await?;
        let restored = server.create_bucket("restore-destination", false).await?;

        let test_data = test_data::make_test_data(
            &client,
            &backup,
            vec![
                TestObject::new("kept", "10KiB"),
                TestObject::new("deleted", "10KiB"),
            ],
        )
        .await?;

        client
            .put_object_tagging()
            .bucket(&backup)
            .key("deleted")
            .tagging(
                Tagging::builder()
                    .tag_set(Tag::builder().key("Deleted").value("True").build()?)
                    .tag_set(
                        Tag::builder()
                            .key("DeletedAt")
                            .value("2023-01-01T00:00:00")
                            .build()?,
                    )
                    .build()?,
            )
            .send()
            .await?;

        let factory = factory(&server).await?;

        let summary =
            RestoreJobBuilder::from_factory(&factory, config_for_minio(&server), &backup, &restored)
                .await?
                .check_deleted_tag(true)
                .build()
                .await?
                .run(futures::future::pending())
                .await?;

        assert_eq!(1, summary.restored());
        assert_eq!(1, summary.skipped_deleted());
        test_data::validate_copies(&client, &restored, &test_data, ["kept"]).await?;

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn purge_deletes_versions_and_bucket() -> Result<()> {
    s3br_testing::logging::test_with_logging(async move {
        let server = MinioServer::get().await?;
        let client = server.aws_client().await?;
        let bucket = server.create_bucket("purge", true).await?;

        test_data::make_test_data(
            &client,
            &bucket,
            vec![TestObject::new("a", "1KiB"), TestObject::new("b", "1KiB")],
        )
        .await?;

        // Overwrite one object so that the bucket holds an old version too
        test_data::put_random_object(&client, &bucket, "a", 100).await?;

        let factory = factory(&server).await?;

        let summary = PurgeJob::from_factory(&factory, &config_for_minio(&server), &bucket)
            .await?
            .include_versions(true)
            .delete_bucket(true)
            .run(futures::future::pending())
            .await?;

        assert!(summary.bucket_deleted);
        assert!(client.head_bucket().bucket(&bucket).send().await.is_err());

        Ok(())
    })
}

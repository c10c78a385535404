//! Create test objects in a bucket and verify copies of them in another
use crate::Result;
use aws_sdk_s3::{primitives::ByteStream, Client};
use color_eyre::eyre::eyre;
use futures::StreamExt;
use rand::prelude::*;
use sha2::Digest;
use std::collections::{BTreeMap, HashMap};

/// Max concurrent S3 operations when dealing with test data
const MAX_CONCURRENCY: usize = 10;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key: key.into(),
            size: size.get_bytes() as usize,
        }
    }
}

/// A test object as it was written to the bucket
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&sha2::Sha256::digest(data));
    hash
}

/// Write each test object to `bucket` with random contents.
///
/// Returns the objects with their data, keyed by object key
pub async fn make_test_data(
    client: &Client,
    bucket: &str,
    objects: impl IntoIterator<Item = TestObject>,
) -> Result<HashMap<String, TestObjectWithData>> {
    let create_futs = objects.into_iter().map(|object| async move {
        let data = put_random_object(client, bucket, &object.key, object.size).await?;

        Result::<_>::Ok(TestObjectWithData {
            hash: sha256(&data),
            key: object.key,
            data,
        })
    });

    let mut created = futures::stream::iter(create_futs).buffer_unordered(MAX_CONCURRENCY);
    let mut test_data = HashMap::new();

    while let Some(object) = created.next().await {
        let object = object?;
        let key = object.key.clone();

        assert!(
            test_data.insert(key.clone(), object).is_none(),
            "BUG: test data contains the key '{key}' more than once"
        );
    }

    Ok(test_data)
}

/// Write one object of `size` random bytes, returning the bytes
pub async fn put_random_object(
    client: &Client,
    bucket: &str,
    key: &str,
    size: usize,
) -> Result<Vec<u8>> {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill(&mut data[..]);

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(ByteStream::from(data.clone()))
        .send()
        .await?;

    Ok(data)
}

/// All keys in a bucket, sorted
pub async fn list_keys(client: &Client, bucket: &str) -> Result<Vec<String>> {
    let mut pages = client
        .list_objects_v2()
        .bucket(bucket)
        .into_paginator()
        .send();

    let mut keys = Vec::new();
    while let Some(page) = pages.next().await {
        keys.extend(
            page?
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string)),
        );
    }

    keys.sort();

    Ok(keys)
}

/// The tags on an object
pub async fn get_tags(client: &Client, bucket: &str, key: &str) -> Result<BTreeMap<String, String>> {
    let output = client
        .get_object_tagging()
        .bucket(bucket)
        .key(key)
        .send()
        .await?;

    Ok(output
        .tag_set()
        .iter()
        .map(|tag| (tag.key().to_string(), tag.value().to_string()))
        .collect())
}

/// Verify that `bucket` holds exactly the objects in `expected_keys`, each with the contents
/// recorded in `test_data`
pub async fn validate_copies<'a>(
    client: &Client,
    bucket: &str,
    test_data: &HashMap<String, TestObjectWithData>,
    expected_keys: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut expected_keys = expected_keys
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    expected_keys.sort();

    let actual_keys = list_keys(client, bucket).await?;
    if actual_keys != expected_keys {
        return Err(eyre!(
            "Bucket {bucket} contains keys {actual_keys:?} but expected {expected_keys:?}"
        ));
    }

    for key in expected_keys {
        let expected = test_data.get(&key).unwrap_or_else(|| {
            panic!("BUG: expected key '{key}' is not in the test data")
        });

        let object = client.get_object().bucket(bucket).key(&key).send().await?;
        let data = object.body.collect().await?.into_bytes();

        if sha256(&data) != expected.hash {
            return Err(eyre!(
                "Object '{key}' in bucket {bucket} doesn't match the test data ({} bytes, expected {})",
                data.len(),
                expected.data.len()
            ));
        }
    }

    Ok(())
}

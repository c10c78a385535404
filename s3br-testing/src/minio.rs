//! Ephemeral [minio](https://min.io) servers, to test against real S3 semantics without touching
//! real S3

use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;
use which::which;

/// Credentials minio accepts out of the box
pub const ACCESS_KEY_ID: &str = "minioadmin";
pub const SECRET_ACCESS_KEY: &str = "minioadmin";

/// Minio doesn't care about regions, but the SDK needs one
pub const REGION: &str = "us-east-1";

pub struct MinioServer {
    #[allow(dead_code)] // Kept so the data dir lives as long as the server
    data_dir: TempDir,
    handle: Handle,
    address: SocketAddr,
}

impl MinioServer {
    /// Get the server shared by all tests currently running, starting it if there is none.
    ///
    /// Starting minio takes a few seconds, so sharing one server saves a lot of time when many
    /// tests run in parallel.  The server is stopped when the last test holding it drops it.
    pub async fn get() -> Result<Arc<Self>> {
        static SHARED: Lazy<Mutex<Weak<MinioServer>>> = Lazy::new(|| Mutex::new(Weak::new()));

        let mut shared = SHARED.lock().await;

        let server = match shared.upgrade() {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *shared = Arc::downgrade(&server);
                server
            }
        };

        server.wait_until_ready().await?;

        Ok(server)
    }

    /// Start a new server on a free port on localhost.
    ///
    /// The `minio` binary is taken from the `MINIO_PATH` env var if set, otherwise from `PATH`.
    pub async fn start() -> Result<Self> {
        let minio = Self::find_minio()?;
        let address = Self::free_address()?;
        let data_dir = Self::data_dir()?;

        let handle = duct::cmd!(
            minio,
            "server",
            data_dir.path(),
            "--address",
            address.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            data_dir,
            handle,
            address,
        };

        debug!(%address, "Waiting for minio to start");
        server.wait_until_ready().await?;
        debug!(%address, "Minio started");

        Ok(server)
    }

    /// The S3 API endpoint of this server
    pub fn endpoint_url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.address))
            .expect("BUG: socket address is always a valid URL host")
    }

    /// A client for this server, authenticated as the admin user
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let sdk_config = aws_config::from_env()
            .region(RegionProviderChain::first_try(REGION))
            .credentials_provider(aws_credential_types::Credentials::from_keys(
                ACCESS_KEY_ID,
                SECRET_ACCESS_KEY,
                None,
            ))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(self.endpoint_url().as_str())
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Create a bucket whose name starts with a random prefix followed by `name`, so that tests
    /// sharing the server never collide.  Returns the actual bucket name.
    pub async fn create_bucket(&self, name: impl AsRef<str>, versioning: bool) -> Result<String> {
        let bucket = Self::unique_bucket_name(name.as_ref());
        let client = self.aws_client().await?;

        debug!(%bucket, "Creating bucket");

        client.create_bucket().bucket(&bucket).send().await?;

        // Minio sometimes reports a just-created bucket as missing for a moment
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        if let Err(e) = policy
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
        {
            return Err(eyre!(
                "Bucket {bucket} is not accessible even after creating it: {e}"
            ));
        }

        if versioning {
            client
                .put_bucket_versioning()
                .bucket(&bucket)
                .versioning_configuration(
                    aws_sdk_s3::types::VersioningConfiguration::builder()
                        .status(aws_sdk_s3::types::BucketVersioningStatus::Enabled)
                        .build(),
                )
                .send()
                .await?;
        }

        Ok(bucket)
    }

    /// A bucket name that's valid and unique but doesn't exist yet
    pub fn unique_bucket_name(name: &str) -> String {
        // Bucket names are at most 63 characters of letters, digits, `.` and `-`
        static INVALID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9a-z\.\-]+").unwrap());

        let name = INVALID.replace_all(&name.to_lowercase(), "-").into_owned();
        let name = &name[..name.len().min(63 - 9)];

        format!("{:08x}-{name}", rand::thread_rng().next_u32())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        // On slow CI machines startup can take a while
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy
            .retry(|| client.list_buckets().send())
            .await
            .map(|_| ())
            .map_err(|e| eyre!("Minio at {} didn't come up in time: {e}", self.address))
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH")
            .map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| eyre!("Unable to find `minio`; set MINIO_PATH or put it in your PATH"))
    }

    fn free_address() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;

        Ok(listener.local_addr()?)
    }

    /// Minio refuses data directories on `tmpfs` (which `/tmp` usually is), so the data goes in a
    /// temporary directory under the home directory instead
    fn data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Stopping minio");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error stopping minio: {e}");
        }
    }
}

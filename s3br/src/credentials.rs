//! Credentials for role-based authorization
//!
//! Backups of large buckets can run for many hours, much longer than the lifetime of the temporary
//! credentials STS hands out when assuming a role.  This provider caches the role's credentials
//! and assumes the role again shortly before they expire.

use crate::Result;
use aws_credential_types::{
    provider::{error::CredentialsError, ProvideCredentials},
    Credentials,
};
use snafu::prelude::*;
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::sync::Mutex;
use tracing::debug;

/// Credentials that expire within this window are refreshed before use
const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

struct RoleCredentialsProviderInner {
    /// Config the STS client is created from; its credentials are used to assume the role
    base_config: aws_types::SdkConfig,
    role_arn: String,
    role_session_name: String,
    credentials: Option<Credentials>,
}

impl RoleCredentialsProviderInner {
    fn cached(&self) -> Option<Credentials> {
        let credentials = self.credentials.as_ref()?;

        match credentials.expiry() {
            Some(expiry) if expiry <= SystemTime::now() + REFRESH_WINDOW => None,
            _ => Some(credentials.clone()),
        }
    }

    async fn assume_role(&mut self) -> Result<Credentials> {
        debug!(role_arn = %self.role_arn, "Assuming role");

        let sts_client = aws_sdk_sts::Client::new(&self.base_config);
        let output = sts_client
            .assume_role()
            .role_arn(&self.role_arn)
            .role_session_name(&self.role_session_name)
            .send()
            .await
            .with_context(|_| crate::error::AssumeRoleSnafu {
                role_arn: self.role_arn.clone(),
            })?;

        let role_credentials =
            output
                .credentials()
                .with_context(|| crate::error::AssumeRoleNoCredentialsSnafu {
                    role_arn: self.role_arn.clone(),
                })?;

        let credentials = Credentials::new(
            role_credentials.access_key_id(),
            role_credentials.secret_access_key(),
            Some(role_credentials.session_token().to_string()),
            SystemTime::try_from(role_credentials.expiration().clone()).ok(),
            "s3br-assume-role",
        );

        self.credentials = Some(credentials.clone());

        Ok(credentials)
    }
}

/// Implements `ProvideCredentials` by assuming a role with the base credentials.
///
/// To assume the role the base credentials are used, make sure they have this permission,
/// otherwise this will fail
#[derive(Clone)]
pub(crate) struct RoleCredentialsProvider(Arc<Mutex<RoleCredentialsProviderInner>>);

impl RoleCredentialsProvider {
    pub(crate) fn new(
        base_config: aws_types::SdkConfig,
        role_arn: impl Into<String>,
        role_session_name: impl Into<String>,
    ) -> Self {
        Self(Arc::new(Mutex::new(RoleCredentialsProviderInner {
            base_config,
            role_arn: role_arn.into(),
            role_session_name: role_session_name.into(),
            credentials: None,
        })))
    }
}

impl Debug for RoleCredentialsProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(RoleCredentialsProvider))
            .finish_non_exhaustive()
    }
}

impl ProvideCredentials for RoleCredentialsProvider {
    fn provide_credentials<'a>(
        &'a self,
    ) -> aws_credential_types::provider::future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        let inner = self.0.clone();
        aws_credential_types::provider::future::ProvideCredentials::new(async move {
            let mut guard = inner.lock().await;

            if let Some(credentials) = guard.cached() {
                return Ok(credentials);
            }

            guard
                .assume_role()
                .await
                .map_err(CredentialsError::provider_error)
        })
    }
}

pub(crate) mod util {
    use aws_config::default_provider::region::DefaultRegionChain;
    use aws_config::meta::region::RegionProviderChain;
    use aws_types::region::Region;

    /// Region used when neither the config nor the environment specify one
    pub const DEFAULT_REGION: &str = "eu-central-1";

    /// creates the `RegionProviderChain`, at first try using passed `region` but if this is `None`
    /// then it looks for the region configuration from environment and the profile, and if there is
    /// none of that either then use [`DEFAULT_REGION`]
    pub fn load_region_provider(
        region: Option<impl AsRef<str>>,
        profile: Option<&str>,
    ) -> RegionProviderChain {
        if let Some(region) = region {
            RegionProviderChain::first_try(Region::new(region.as_ref().to_string()))
        } else {
            let mut chain = DefaultRegionChain::builder();
            if let Some(profile) = profile {
                chain = chain.profile_name(profile);
            }

            RegionProviderChain::first_try(chain.build()).or_else(DEFAULT_REGION)
        }
    }
}

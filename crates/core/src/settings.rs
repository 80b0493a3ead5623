//! Typed step-instance settings.
//!
//! Replaces the host's string-keyed `backup_*` / `s3_*` settings lookup.
//! Settings are validated once, when a job is requested, never rediscovered
//! while the job runs.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::options::BackupOptions;

/// Settings of one backup step instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSettings {
    /// Option set handed to the archive engine.
    #[serde(default)]
    pub options: BackupOptions,
    /// Whether the archive should be uploaded to a remote store.
    #[serde(default)]
    pub upload: bool,
    /// This instance's own destination; the deployment default when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<S3Settings>,
}

impl StepSettings {
    pub fn new(options: BackupOptions, upload: bool) -> Self {
        Self {
            options,
            upload,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: S3Settings) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        match &self.remote {
            Some(remote) => remote.validate(),
            None => Ok(()),
        }
    }

    /// Copy safe to hand out: no secret key material.
    pub fn redacted(&self) -> Self {
        Self {
            remote: self.remote.as_ref().map(S3Settings::redacted),
            ..self.clone()
        }
    }
}

/// How the S3 client obtains credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum S3Credentials {
    /// Static access key pair.
    Static {
        access_key_id: String,
        secret_access_key: String,
    },
    /// Resolve from the environment / instance profile (SDK default chain).
    Ambient,
}

impl core::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            S3Credentials::Static { access_key_id, .. } => f
                .debug_struct("Static")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &REDACTED)
                .finish(),
            S3Credentials::Ambient => f.write_str("Ambient"),
        }
    }
}

/// Remote object store destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub credentials: S3Credentials,
    /// Custom endpoint for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// HTTP proxy for all requests to the store.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Prepended to the archive filename to form the object key.
    #[serde(default)]
    pub key_prefix: String,
}

impl S3Settings {
    /// Same rules as the step's admin form: bucket and region always, key
    /// pair unless credentials are resolved from the environment.
    pub fn validate(&self) -> DomainResult<()> {
        if self.bucket.trim().is_empty() {
            return Err(DomainError::MissingField("bucket"));
        }
        if self.region.trim().is_empty() {
            return Err(DomainError::MissingField("region"));
        }
        if let S3Credentials::Static {
            access_key_id,
            secret_access_key,
        } = &self.credentials
        {
            if access_key_id.trim().is_empty() {
                return Err(DomainError::MissingField("access_key_id"));
            }
            if secret_access_key.trim().is_empty() {
                return Err(DomainError::MissingField("secret_access_key"));
            }
        }
        if let Some(proxy) = &self.proxy_url {
            if proxy.trim().is_empty() {
                return Err(DomainError::validation("proxy_url cannot be blank"));
            }
        }
        Ok(())
    }

    pub fn redacted(&self) -> Self {
        let credentials = match &self.credentials {
            S3Credentials::Static { access_key_id, .. } => S3Credentials::Static {
                access_key_id: access_key_id.clone(),
                secret_access_key: REDACTED.to_string(),
            },
            S3Credentials::Ambient => S3Credentials::Ambient,
        };
        Self {
            credentials,
            ..self.clone()
        }
    }
}

const REDACTED: &str = "<redacted>";

use crate::client::RegistryClient;
use crate::models::{DockerConfig, ErrorResponse, Token};
use crate::uri::RegistryUri;
use crate::{error, Result};
#[cfg(feature = "aws")]
use aws_config::BehaviorVersion;
use base64::Engine;
use bytes::Bytes;
use cfg_if::cfg_if;
use futures::stream::{Stream, TryStreamExt};
use home::home_dir;
use keyring::Entry;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use snafu::{ensure, OptionExt, ResultExt};
use url::Url;

const COMMON_AUTH_FILES: &[&str] = &[".finch/config.json", ".docker/config.json"];

/// Represents a client to a specific OCI registry.
/// Most requests will go through this structure
#[derive(Clone, Debug)]
pub struct Registry {
    /// URI of the registry
    uri: RegistryUri,
    /// Registry client to use
    pub(crate) client: RegistryClient,
}

async fn discover_auth(registry: &RegistryUri) -> crate::Result<Option<Token>> {
    // First check our common auth files for an entry
    for file in COMMON_AUTH_FILES {
        if let Some(path) = home_dir() {
            let path = path.join(file);
            if path.exists() {
                let auth = tokio::fs::read_to_string(path)
                    .await
                    .context(error::FileSnafu)?;
                let config: DockerConfig =
                    serde_json::from_str(&auth).context(error::BodyDeserializeSnafu)?;
                if let Some(entry) = config.auths.get(registry.base()) {
                    // If both the auth and identity token are null then the password is probably stored in the system keychain
                    if entry.auth.is_none() && entry.identitytoken.is_none() {
                        if let Ok(entry) = Entry::new("docker-credential-helpers", registry.base())
                        {
                            if let Ok(password) = entry.get_password() {
                                let decoded = base64::engine::general_purpose::STANDARD
                                    .decode(password)
                                    .unwrap_or_default();
                                let decoded = String::from_utf8_lossy(decoded.as_slice());
                                if let Some((username, password)) = decoded.split_once(':') {
                                    return Ok(Some(Token::Basic {
                                        username: username.to_string(),
                                        password: password.to_string(),
                                    }));
                                } else {
                                    return Ok(Some(Token::Bearer(decoded.to_string())));
                                }
                            } else {
                                return Ok(None);
                            }
                        }
                    }
                    return Ok(Token::parse(entry.clone()));
                }
            }
        }
    }
    // If we get here then we may want to try and utilize credential helpers for given registry types
    cfg_if! {
        if #[cfg(feature = "aws")] {
            if registry.base().starts_with("public.ecr.aws") {
                debug!(target: "registry", "using public ecr");
                // Public ecr
                let sdk_config = aws_config::defaults(BehaviorVersion::latest()).region("us-east-1").load().await;
                let ecr_client = aws_sdk_ecrpublic::Client::new(&sdk_config);
                let ecr_response = ecr_client.get_authorization_token().send()
                    .await
                    .map_err(|e| { error!("public ecr: {:?}", e); error::Error::AuthFailed { reason: e.to_string() } })?;
                trace!(target: "registry", "public ecr authorization response: {:?}", ecr_response);
                Ok(ecr_response.authorization_data()
                    .and_then(|x| x.authorization_token.clone()
                    .map(Token::Bearer)))
            } else if registry.base().contains("ecr") {
                debug!(target: "registry", "using private ecr");
                let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
                let ecr_client = aws_sdk_ecr::Client::new(&sdk_config);
                let ecr_response = ecr_client.get_authorization_token()
                    .send()
                    .await
                    .map_err(|e| error::Error::AuthFailed { reason: e.to_string() })?;
                trace!(target: "registry", "private ecr authorization response: {:?}", ecr_response);
                Ok(ecr_response.authorization_data()
                    .first()
                    .and_then(|x| {
                        x.authorization_token().and_then(|y| {
                            let decoded = base64::engine::general_purpose::STANDARD.decode(y).ok()?;
                            let decoded = String::from_utf8_lossy(decoded.as_slice()).to_string();
                            let password = decoded.strip_prefix("AWS:")?.to_string();
                            Some(Token::Basic { username: "AWS".to_string(), password })
                        })
                    }))
            } else {
                Ok(None)
            }
        } else {
            Ok(None)
        }
    }
}

impl Registry {
    /// Given a uri to a registry create a new registry client and gather
    /// the appropriate authorization.
    pub async fn new(uri: &RegistryUri) -> Result<Self> {
        let token = discover_auth(uri).await?;
        Ok(Self {
            client: RegistryClient::new(token),
            uri: uri.clone(),
        })
    }

    /// Change the security of the registry connection
    pub fn set_secure(&mut self, flag: bool) {
        self.uri.set_secure(flag);
    }

    /// Return the registry uri for this client
    pub fn uri(&self) -> &RegistryUri {
        &self.uri
    }

    /// Convert the registry uri into the url to call
    pub fn url(&self) -> crate::Result<Url> {
        self.uri.clone().try_into()
    }

    /// Check for the existence of a manifest in the registry
    pub async fn check_manifest(&self, repository: &str, reference: &str) -> Result<bool> {
        let response = self
            .client
            .head_manifest(self.url()?, repository.into(), reference.into())
            .await?;
        trace!(target: "registry", "head_manifest: {:?}", response);
        Ok(response.status().is_success())
    }

    /// Fetch the raw bytes of a manifest plus the content type the registry
    /// reported. The raw form is what gets persisted on the image row and is
    /// the input for digest computation when resolving tags.
    pub async fn fetch_manifest_raw(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(Bytes, Option<String>)> {
        let response = self
            .client
            .get_manifest(self.url()?, repository.into(), reference.into())
            .await?;
        trace!(target: "registry", "get_manifest: {:?}", response);
        let response = Self::ensure_manifest_success(response).await?;
        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|x| x.to_str().ok())
            .map(|x| x.to_string());
        let bytes = response.bytes().await.context(error::RequestSnafu)?;
        Ok((bytes, content_type))
    }

    /// Fetch a manifest from the registry, this could be an Image Index or an Image manifest
    pub async fn fetch_manifest<T>(&self, repository: &str, reference: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let (bytes, _) = self.fetch_manifest_raw(repository, reference).await?;
        serde_json::from_slice(bytes.as_ref()).context(error::BodyDeserializeSnafu)
    }

    /// Fetch a blob from the registry as a byte stream plus its total size
    pub async fn fetch_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<(
        impl Stream<Item = std::result::Result<Bytes, std::io::Error>>,
        u64,
    )> {
        let response = self
            .client
            .get_blob(self.url()?, repository.into(), digest.into())
            .await?;
        trace!(target: "registry", "get_blob: {:?}", response);
        let response = Self::ensure_blob_success(response, digest).await?;
        let size: u64 = response
            .headers()
            .clone()
            .get("Content-Length")
            .context(error::ContentLengthMissingSnafu)?
            .to_str()
            .context(error::ImproperHeaderSnafu)?
            .parse()
            .context(error::ContentLengthNotNumberSnafu)?;
        Ok((response.bytes_stream().map_err(std::io::Error::other), size))
    }

    /// Fetch an inclusive byte range of a blob. `end` of `None` reads to the
    /// end of the blob (`bytes={start}-`).
    pub async fn fetch_blob_range(
        &self,
        repository: &str,
        digest: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<impl Stream<Item = std::result::Result<Bytes, std::io::Error>>> {
        let range = match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        let response = self
            .client
            .get_blob_range(self.url()?, repository.into(), digest.into(), range)
            .await?;
        trace!(target: "registry", "get_blob_range: {:?}", response);
        let response = Self::ensure_blob_success(response, digest).await?;
        Ok(response.bytes_stream().map_err(std::io::Error::other))
    }

    /// Fetch a small blob (an image config) fully into memory
    pub async fn fetch_blob_bytes(&self, repository: &str, digest: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_blob(self.url()?, repository.into(), digest.into())
            .await?;
        trace!(target: "registry", "get_blob: {:?}", response);
        let response = Self::ensure_blob_success(response, digest).await?;
        response.bytes().await.context(error::RequestSnafu)
    }

    async fn ensure_blob_success(response: Response, digest: &str) -> Result<Response> {
        match response.status() {
            StatusCode::NOT_FOUND => error::BlobNotFoundSnafu {
                key: digest.to_string(),
            }
            .fail(),
            StatusCode::UNAUTHORIZED => error::AuthFailedSnafu {
                reason: "registry returned 401 after token refresh".to_string(),
            }
            .fail(),
            status if status.is_success() => Ok(response),
            _ => error::FetchBlobSnafu {
                reason: response
                    .json::<ErrorResponse>()
                    .await
                    .context(error::ErrorDeserializeSnafu)?,
            }
            .fail(),
        }
    }

    async fn ensure_manifest_success(response: Response) -> Result<Response> {
        ensure!(
            response.status() != StatusCode::UNAUTHORIZED,
            error::AuthFailedSnafu {
                reason: "registry returned 401 after token refresh".to_string(),
            }
        );
        ensure!(
            response.status().is_success(),
            error::FetchManifestSnafu {
                reason: response
                    .json::<ErrorResponse>()
                    .await
                    .context(error::ErrorDeserializeSnafu)?
            }
        );
        Ok(response)
    }
}

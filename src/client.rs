use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use snafu::ResultExt;
use url::Url;

use crate::models::{MediaType, Token, TokenResponse};
use crate::{error, Result};

/// A trait for a client implementing requests to an oci registry. This is primarily implemented
/// to allow for ease of unittesting this crate.
#[async_trait]
pub(crate) trait RegistryClientImpl: Send + Sync + Debug {
    /// HEAD {uri}/v2/{repository}/manifests/{reference}
    async fn head_manifest(&self, uri: &Url, repository: &str, reference: &str)
        -> Result<Response>;
    /// GET {uri}/v2/{repository}/manifests/{reference}
    async fn get_manifest(&self, uri: &Url, repository: &str, reference: &str) -> Result<Response>;
    /// GET {uri}/v2/{repository}/blobs/{digest}
    async fn get_blob(&self, uri: &Url, repository: &str, digest: &str) -> Result<Response>;
    /// GET {uri}/v2/{repository}/blobs/{digest} with a Range header
    async fn get_blob_range(
        &self,
        uri: &Url,
        repository: &str,
        digest: &str,
        range: &str,
    ) -> Result<Response>;
}

/// Implements a registry client using reqwest. Requests are sent with the
/// configured credentials; a 401 triggers the registry's bearer token
/// challenge once, after which the minted token is reused for the lifetime of
/// the client.
#[derive(Debug)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
    /// Credentials discovered up front (docker config, keychain, ECR)
    configured: Option<Token>,
    /// Bearer token minted from a WWW-Authenticate challenge
    bearer: Mutex<Option<String>>,
}

impl HttpRegistryClient {
    pub fn new(auth: Option<Token>) -> Self {
        Self {
            client: reqwest::Client::new(),
            configured: auth,
            bearer: Mutex::new(None),
        }
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(bearer) = self.bearer.lock().unwrap().as_ref() {
            return request.bearer_auth(bearer);
        }
        if let Some(token) = self.configured.as_ref() {
            match token {
                Token::Bearer(t) => request.bearer_auth(t),
                Token::Basic { username, password } => request.basic_auth(username, Some(password)),
            }
        } else {
            request
        }
    }

    /// Send a request, answering a bearer challenge and retrying once if the
    /// registry responds 401. The second 401 is returned to the caller.
    async fn execute<F>(&self, repository: &str, make: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let response = self
            .apply_auth(make(&self.client))
            .send()
            .await
            .context(error::RequestSnafu)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|x| x.to_str().ok())
            .map(|x| x.to_string());
        let Some(challenge) = challenge else {
            return Ok(response);
        };
        self.refresh_token(challenge.as_str(), repository).await?;
        self.apply_auth(make(&self.client))
            .send()
            .await
            .context(error::RequestSnafu)
    }

    async fn refresh_token(&self, challenge: &str, repository: &str) -> Result<()> {
        let Some(challenge) = BearerChallenge::parse(challenge) else {
            return error::AuthFailedSnafu {
                reason: format!("unsupported authenticate challenge: {challenge}"),
            }
            .fail();
        };
        trace!(target: "client", "answering bearer challenge: {:?}", challenge);

        let mut url = Url::parse(challenge.realm.as_str()).context(error::UrlSnafu)?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(service) = challenge.service.as_ref() {
                pairs.append_pair("service", service);
            }
            let scope = challenge
                .scope
                .unwrap_or_else(|| format!("repository:{repository}:pull"));
            pairs.append_pair("scope", scope.as_str());
        }

        let mut request = self.client.get(url);
        // Basic credentials mint broader tokens than anonymous requests
        if let Some(Token::Basic { username, password }) = self.configured.as_ref() {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await.context(error::RequestSnafu)?;
        if !response.status().is_success() {
            return error::AuthFailedSnafu {
                reason: format!("token endpoint returned {}", response.status()),
            }
            .fail();
        }
        let token: TokenResponse = response
            .json()
            .await
            .context(error::ResponseDeserializeSnafu)?;
        match token.into_token() {
            Some(token) => {
                *self.bearer.lock().unwrap() = Some(token);
                Ok(())
            }
            None => error::AuthFailedSnafu {
                reason: "token endpoint returned no token".to_string(),
            }
            .fail(),
        }
    }
}

/// A parsed `WWW-Authenticate: Bearer ...` header
#[derive(Debug)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header.strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for param in params.split(',') {
            let (key, value) = param.trim().split_once('=')?;
            let value = value.trim_matches('"').to_string();
            match key {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

#[async_trait]
impl RegistryClientImpl for HttpRegistryClient {
    async fn head_manifest(
        &self,
        uri: &Url,
        repository: &str,
        reference: &str,
    ) -> Result<Response> {
        let url = uri
            .join(&format!("/v2/{}/manifests/{}", repository, reference))
            .context(error::UrlSnafu)?;
        self.execute(repository, |client| {
            client
                .head(url.clone())
                .header("Accept", MediaType::MANIFEST_ACCEPT)
        })
        .await
    }

    async fn get_manifest(&self, uri: &Url, repository: &str, reference: &str) -> Result<Response> {
        let url = uri
            .join(&format!("/v2/{}/manifests/{}", repository, reference))
            .context(error::UrlSnafu)?;
        self.execute(repository, |client| {
            client
                .get(url.clone())
                .header("Accept", MediaType::MANIFEST_ACCEPT)
        })
        .await
    }

    async fn get_blob(&self, uri: &Url, repository: &str, digest: &str) -> Result<Response> {
        let url = uri
            .join(&format!("/v2/{}/blobs/{}", repository, digest))
            .context(error::UrlSnafu)?;
        self.execute(repository, |client| client.get(url.clone()))
            .await
    }

    async fn get_blob_range(
        &self,
        uri: &Url,
        repository: &str,
        digest: &str,
        range: &str,
    ) -> Result<Response> {
        let url = uri
            .join(&format!("/v2/{}/blobs/{}", repository, digest))
            .context(error::UrlSnafu)?;
        self.execute(repository, |client| {
            client.get(url.clone()).header("Range", range)
        })
        .await
    }
}

/// Handle to a registry client. This primarily is utilized as an intercept point for unittesting
#[derive(Clone, Debug)]
pub struct RegistryClient {
    client: Arc<dyn RegistryClientImpl>,
}

impl RegistryClient {
    pub fn new(auth: Option<Token>) -> Self {
        Self {
            client: Arc::new(HttpRegistryClient::new(auth)),
        }
    }

    pub async fn head_manifest(
        &self,
        uri: Url,
        repository: String,
        reference: String,
    ) -> Result<Response> {
        self.client
            .head_manifest(&uri, repository.as_str(), reference.as_str())
            .await
    }

    pub async fn get_manifest(
        &self,
        uri: Url,
        repository: String,
        reference: String,
    ) -> Result<Response> {
        self.client
            .get_manifest(&uri, repository.as_str(), reference.as_str())
            .await
    }

    pub async fn get_blob(&self, uri: Url, repository: String, digest: String) -> Result<Response> {
        self.client
            .get_blob(&uri, repository.as_str(), digest.as_str())
            .await
    }

    pub async fn get_blob_range(
        &self,
        uri: Url,
        repository: String,
        digest: String,
        range: String,
    ) -> Result<Response> {
        self.client
            .get_blob_range(&uri, repository.as_str(), digest.as_str(), range.as_str())
            .await
    }
}

#[cfg(test)]
mod test {
    use super::BearerChallenge;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = BearerChallenge::parse(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/ubuntu:pull\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/ubuntu:pull")
        );
    }

    #[test]
    fn test_parse_basic_challenge_rejected() {
        assert!(BearerChallenge::parse("Basic realm=\"registry\"").is_none());
    }
}

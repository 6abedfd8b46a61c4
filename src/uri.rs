use snafu::{OptionExt, ResultExt};
use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;
use url::Url;

use crate::error;

/// A parsed reference to an image in an OCI registry. Unlike a live registry
/// handle this is inert data: the `(repo, digest)` pair derived from it keys
/// every stored artifact and metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry the image lives in
    registry: RegistryUri,
    /// Repository path within the registry
    repository: String,
    /// Tag the caller used, if any (kept even when a digest pins the image)
    tag: Option<String>,
    /// Reference to the image, a tag ':tag' or digest '@sha256:...'
    reference: Reference,
}

/// Uri to a specific registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUri {
    /// Registry host (and optional port)
    base: String,
    /// Whether to connect with https or not
    is_secure: bool,
}

impl RegistryUri {
    pub fn base(&self) -> &String {
        &self.base
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    pub fn set_secure(&mut self, flag: bool) {
        self.is_secure = flag;
    }
}

impl FromStr for RegistryUri {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (registry_base, is_secure) = if s.starts_with("http://") {
            (s.strip_prefix("http://").unwrap(), false)
        } else if s.starts_with("https://") {
            (s.strip_prefix("https://").unwrap(), true)
        } else {
            (s, !(s.contains("localhost") || s.contains("127.0.0.1")))
        };
        Ok(Self {
            base: registry_base.to_string(),
            is_secure,
        })
    }
}

impl TryInto<Url> for RegistryUri {
    type Error = crate::error::Error;

    fn try_into(self) -> Result<Url, Self::Error> {
        Url::parse(&format!(
            "{}://{}",
            if self.is_secure { "https" } else { "http" },
            self.base
        ))
        .context(crate::error::UrlSnafu)
    }
}

impl ImageRef {
    /// Parse an image reference of the shape
    /// `host[:port]/repository[:tag][@algorithm:digest]`.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let (registry, object) = input.split_once('/').context(error::MalformedUriSnafu {
            reason: "only a registry was provided in the reference",
        })?;
        let registry = RegistryUri::from_str(registry)?;

        let (object, digest) = match object.split_once('@') {
            Some((object, digest)) => {
                let (algorithm, value) =
                    digest.split_once(':').context(error::MalformedUriSnafu {
                        reason: "no algorithm was provided for the digest",
                    })?;
                (
                    object,
                    Some(Reference::Digest {
                        algorithm: Algorithm::from_str(algorithm)?,
                        value: value.to_string(),
                    }),
                )
            }
            None => (object, None),
        };

        // A tag may be present on its own or alongside a pinning digest; the
        // colon of a port number can only appear before the first slash, so a
        // colon in the object portion always introduces a tag.
        let (repository, tag) = match object.split_once(':') {
            Some((repository, tag)) => (repository, Some(tag.to_string())),
            None => (object, None),
        };

        let reference = match (digest, tag.as_ref()) {
            (Some(digest), _) => digest,
            (None, Some(tag)) => Reference::Tag(tag.clone()),
            (None, None) => {
                return error::MalformedUriSnafu {
                    reason: "no tag or digest was provided for the image",
                }
                .fail()
            }
        };

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            reference,
        })
    }

    pub fn set_secure(&mut self, flag: bool) {
        self.registry.set_secure(flag);
    }

    pub fn registry(&self) -> &RegistryUri {
        &self.registry
    }

    pub fn repository(&self) -> &String {
        &self.repository
    }

    pub fn tag(&self) -> Option<&String> {
        self.tag.as_ref()
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// The repository string used in metadata keys and the merged index key:
    /// registry host plus repository path.
    pub fn repo(&self) -> String {
        format!("{}/{}", self.registry.base, self.repository)
    }

    /// The digest string if this reference pins one
    pub fn digest(&self) -> Option<String> {
        match &self.reference {
            Reference::Digest { .. } => Some(self.reference.to_string()),
            Reference::Tag(_) => None,
        }
    }

    /// Replace the reference with a resolved digest, keeping the tag around
    /// for metadata purposes.
    pub fn with_digest(mut self, digest: &str) -> crate::Result<Self> {
        self.reference = Reference::from_str(digest)?;
        Ok(self)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{}/{}{}",
            self.registry.base,
            self.repository,
            match &self.reference {
                Reference::Tag(tag) => format!(":{tag}"),
                Reference::Digest { algorithm, value } => format!("@{algorithm}:{value}"),
            }
        ))
    }
}

/// Represents a reference to a specific image via a tag or digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest { algorithm: Algorithm, value: String },
}

impl FromStr for Reference {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            let (algorithm, value) = s.split_once(':').unwrap();
            Ok(Self::Digest {
                algorithm: Algorithm::from_str(algorithm)?,
                value: value.to_string(),
            })
        } else {
            Ok(Self::Tag(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl FromStr for Algorithm {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => crate::error::InvalidAlgorithmSnafu {
                algorithm: s.to_string(),
            }
            .fail(),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest { algorithm, value } => {
                f.write_fmt(format_args!("{}:{}", algorithm, value))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    #[test]
    fn test_registry_from_str() {
        let registry = super::RegistryUri::from_str("localhost:5000").unwrap();
        assert_eq!(registry.base, "localhost:5000");
        assert!(!registry.is_secure);
        let registry = super::RegistryUri::from_str("127.0.0.1").unwrap();
        assert_eq!(registry.base, "127.0.0.1");
        assert!(!registry.is_secure);
        let registry = super::RegistryUri::from_str("mcr.microsoft.com").unwrap();
        assert_eq!(registry.base, "mcr.microsoft.com");
        assert!(registry.is_secure);
        let registry = super::RegistryUri::from_str("http://public.ecr.aws").unwrap();
        assert_eq!(registry.base, "public.ecr.aws");
        assert!(!registry.is_secure);
    }

    #[test]
    fn test_registry_into_url() {
        let registry = super::RegistryUri::from_str("localhost:5000").unwrap();
        let url: super::Url = registry.try_into().unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/");
        let registry = super::RegistryUri::from_str("mcr.microsoft.com").unwrap();
        let url: super::Url = registry.try_into().unwrap();
        assert_eq!(url.as_str(), "https://mcr.microsoft.com/");
    }

    #[test]
    fn test_algorithm_from_str() {
        let algorithm = super::Algorithm::from_str("sha256").unwrap();
        assert_eq!(algorithm, super::Algorithm::Sha256);
        let algorithm = super::Algorithm::from_str("sha512").unwrap();
        assert_eq!(algorithm, super::Algorithm::Sha512);
        assert!(super::Algorithm::from_str("md5").is_err());
    }

    #[test]
    fn test_image_ref_tag() {
        let image = super::ImageRef::parse("localhost:5000/browse-test:latest").unwrap();
        assert_eq!(image.registry.base, "localhost:5000");
        assert_eq!(image.repository, "browse-test");
        assert_eq!(
            image.reference,
            super::Reference::Tag("latest".to_string())
        );
        assert_eq!(image.repo(), "localhost:5000/browse-test");
        assert_eq!(image.to_string(), "localhost:5000/browse-test:latest");
        assert_eq!(image.digest(), None);
    }

    #[test]
    fn test_image_ref_digest() {
        let image =
            super::ImageRef::parse("mcr.microsoft.com/dotnet/sdk@sha256:1234567890abcdef")
                .unwrap();
        assert_eq!(image.repository, "dotnet/sdk");
        assert_eq!(image.tag, None);
        assert_eq!(
            image.digest(),
            Some("sha256:1234567890abcdef".to_string())
        );
        assert_eq!(
            image.to_string(),
            "mcr.microsoft.com/dotnet/sdk@sha256:1234567890abcdef"
        );
    }

    #[test]
    fn test_image_ref_tag_and_digest() {
        let image =
            super::ImageRef::parse("mcr.microsoft.com/dotnet/sdk:6.0@sha256:1234567890abcdef")
                .unwrap();
        assert_eq!(image.repository, "dotnet/sdk");
        assert_eq!(image.tag, Some("6.0".to_string()));
        assert_eq!(
            image.reference,
            super::Reference::Digest {
                algorithm: super::Algorithm::Sha256,
                value: "1234567890abcdef".to_string(),
            }
        );
    }

    #[test]
    fn test_image_ref_rejects_bare_repo() {
        assert!(super::ImageRef::parse("no-registry").is_err());
        assert!(super::ImageRef::parse("example.com/repo").is_err());
    }
}

//! Package source classification
//!
//! A Workflow names exactly one place its package comes from. The URL scheme
//! wins over `fromPath`; `fromConfigMap` and `instance` must not be combined
//! with anything else.

use std::fmt;

use flowpod_common::crd::{non_empty, WorkflowSpec};

use crate::error::ManifestError;

/// Where the workflow package comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackageSource {
    /// Git over https; `host` keeps any explicit port and `path` has no leading `/`
    Https {
        url: String,
        host: String,
        path: String,
    },
    /// Git over ssh (`git@host:org/repo`)
    Ssh { url: String },
    /// Inline package definition stored in a ConfigMap
    ConfigMap { name: String },
    /// Package already present on one of the pod's volumes
    FromPath,
    /// Re-run of an existing instance directory on the working volume
    Instance { name: String },
}

/// Name of a [`PackageSource`] variant, used in messages and logs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageSourceKind {
    Https,
    Ssh,
    ConfigMap,
    FromPath,
    Instance,
}

impl PackageSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageSourceKind::Https => "https",
            PackageSourceKind::Ssh => "ssh",
            PackageSourceKind::ConfigMap => "configMap",
            PackageSourceKind::FromPath => "fromPath",
            PackageSourceKind::Instance => "instance",
        }
    }
}

impl fmt::Display for PackageSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PackageSource {
    /// Classify the package source of `spec`.
    ///
    /// Fails with `SpecConflict` when two sources are configured, with
    /// `SpecIncomplete` when none is, and with `MalformedUrl` when an https
    /// URL does not parse.
    pub fn classify(spec: &WorkflowSpec) -> Result<Self, ManifestError> {
        let mut source = None;

        if let Some(package) = &spec.package {
            let url = non_empty(&package.url).unwrap_or_default();
            if url.starts_with("https") {
                source = Some(Self::https(url)?);
            } else if url.starts_with("git@") {
                source = Some(Self::Ssh {
                    url: url.to_string(),
                });
            } else if non_empty(&package.from_path).is_some() {
                source = Some(Self::FromPath);
            }

            if let Some(name) = non_empty(&package.from_config_map) {
                if let Some(existing) = &source {
                    return Err(ManifestError::conflict(format!(
                        "spec.package.fromConfigMap set but package is already configured as {}",
                        existing.kind()
                    )));
                }
                source = Some(Self::ConfigMap {
                    name: name.to_string(),
                });
            }
        }

        if let Some(name) = non_empty(&spec.instance) {
            if source.is_some() {
                return Err(ManifestError::conflict(
                    "spec.instance and spec.package are mutually exclusive",
                ));
            }
            source = Some(Self::Instance {
                name: name.to_string(),
            });
        }

        source.ok_or_else(|| {
            ManifestError::incomplete("workflow does not have a populated spec.package or spec.instance")
        })
    }

    fn https(url: &str) -> Result<Self, ManifestError> {
        let parsed = url::Url::parse(url).map_err(|e| ManifestError::malformed_url(url, e))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ManifestError::malformed_url(url, "missing host"))?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self::Https {
            url: url.to_string(),
            host,
            path: parsed.path().trim_start_matches('/').to_string(),
        })
    }

    pub fn kind(&self) -> PackageSourceKind {
        match self {
            PackageSource::Https { .. } => PackageSourceKind::Https,
            PackageSource::Ssh { .. } => PackageSourceKind::Ssh,
            PackageSource::ConfigMap { .. } => PackageSourceKind::ConfigMap,
            PackageSource::FromPath => PackageSourceKind::FromPath,
            PackageSource::Instance { .. } => PackageSourceKind::Instance,
        }
    }

    /// Whether the package is fetched by an init container
    pub fn needs_fetch(&self) -> bool {
        matches!(
            self,
            PackageSource::Https { .. } | PackageSource::Ssh { .. } | PackageSource::ConfigMap { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpod_common::crd::PackageRef;

    fn package(url: Option<&str>) -> PackageRef {
        PackageRef {
            url: url.map(str::to_string),
            ..Default::default()
        }
    }

    fn spec_with(package: Option<PackageRef>, instance: Option<&str>) -> WorkflowSpec {
        WorkflowSpec {
            package,
            instance: instance.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn https_url_keeps_host_and_path() {
        let spec = spec_with(Some(package(Some("https://example.com/org/repo.git"))), None);
        let source = PackageSource::classify(&spec).unwrap();
        assert_eq!(
            source,
            PackageSource::Https {
                url: "https://example.com/org/repo.git".to_string(),
                host: "example.com".to_string(),
                path: "org/repo.git".to_string(),
            }
        );
        assert_eq!(source.kind(), PackageSourceKind::Https);
        assert!(source.needs_fetch());
    }

    #[test]
    fn https_host_keeps_explicit_port() {
        let spec = spec_with(Some(package(Some("https://git.local:8443/org/repo"))), None);
        match PackageSource::classify(&spec).unwrap() {
            PackageSource::Https { host, .. } => assert_eq!(host, "git.local:8443"),
            other => panic!("expected https, got {other:?}"),
        }
    }

    #[test]
    fn unparsable_https_url_is_malformed() {
        let spec = spec_with(Some(package(Some("https://exa mple.com/repo"))), None);
        let err = PackageSource::classify(&spec).unwrap_err();
        assert!(matches!(err, ManifestError::MalformedUrl { .. }));
    }

    #[test]
    fn git_at_url_is_ssh() {
        let spec = spec_with(Some(package(Some("git@github.com:org/repo.git"))), None);
        assert_eq!(
            PackageSource::classify(&spec).unwrap(),
            PackageSource::Ssh {
                url: "git@github.com:org/repo.git".to_string()
            }
        );
    }

    #[test]
    fn from_path_without_url() {
        let spec = spec_with(
            Some(PackageRef {
                from_path: Some("/data/pkg".to_string()),
                ..Default::default()
            }),
            None,
        );
        let source = PackageSource::classify(&spec).unwrap();
        assert_eq!(source, PackageSource::FromPath);
        assert!(!source.needs_fetch());
    }

    #[test]
    fn url_scheme_wins_over_from_path() {
        let spec = spec_with(
            Some(PackageRef {
                url: Some("git@host:org/repo".to_string()),
                from_path: Some("sub/dir".to_string()),
                ..Default::default()
            }),
            None,
        );
        assert_eq!(
            PackageSource::classify(&spec).unwrap().kind(),
            PackageSourceKind::Ssh
        );
    }

    #[test]
    fn config_map_alone() {
        let spec = spec_with(
            Some(PackageRef {
                from_config_map: Some("lambda".to_string()),
                ..Default::default()
            }),
            None,
        );
        assert_eq!(
            PackageSource::classify(&spec).unwrap(),
            PackageSource::ConfigMap {
                name: "lambda".to_string()
            }
        );
    }

    #[test]
    fn ssh_plus_config_map_conflicts_citing_ssh() {
        let spec = spec_with(
            Some(PackageRef {
                url: Some("git@host:org/repo".to_string()),
                from_config_map: Some("lambda".to_string()),
                ..Default::default()
            }),
            None,
        );
        match PackageSource::classify(&spec).unwrap_err() {
            ManifestError::SpecConflict { message } => assert!(message.contains("ssh")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn from_path_plus_config_map_conflicts() {
        let spec = spec_with(
            Some(PackageRef {
                from_path: Some("/x".to_string()),
                from_config_map: Some("lambda".to_string()),
                ..Default::default()
            }),
            None,
        );
        match PackageSource::classify(&spec).unwrap_err() {
            ManifestError::SpecConflict { message } => assert!(message.contains("fromPath")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn instance_alone() {
        let spec = spec_with(None, Some("run-1.instance"));
        assert_eq!(
            PackageSource::classify(&spec).unwrap(),
            PackageSource::Instance {
                name: "run-1.instance".to_string()
            }
        );
    }

    #[test]
    fn package_plus_instance_conflicts() {
        let spec = spec_with(
            Some(package(Some("https://example.com/org/repo.git"))),
            Some("run-1.instance"),
        );
        assert!(matches!(
            PackageSource::classify(&spec),
            Err(ManifestError::SpecConflict { .. })
        ));
    }

    #[test]
    fn nothing_configured_is_incomplete() {
        for spec in [
            spec_with(None, None),
            spec_with(Some(PackageRef::default()), None),
            spec_with(Some(package(Some("ftp://example.com/repo"))), Some("")),
        ] {
            assert!(matches!(
                PackageSource::classify(&spec),
                Err(ManifestError::SpecIncomplete { .. })
            ));
        }
    }

    #[test]
    fn kind_names() {
        assert_eq!(PackageSourceKind::ConfigMap.to_string(), "configMap");
        assert_eq!(PackageSourceKind::FromPath.to_string(), "fromPath");
        assert_eq!(PackageSourceKind::Instance.to_string(), "instance");
    }
}

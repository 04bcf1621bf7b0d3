//! Workflow to pod compilation
//!
//! [`ManifestCompiler`] is pure: it reads the Workflow, the resolved
//! defaults and the operator environment, and returns an [`ExecutionPlan`]
//! or an error. It never mutates the Workflow it was given and never
//! returns a partial plan.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    Lifecycle, LifecycleHandler, PodSecurityContext, SecretKeySelector, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use flowpod_common::config::OperatorEnv;
use flowpod_common::crd::{non_empty, PackageRef, S3BucketInput, S3InputVariable, Workflow, WorkflowSpec};
use flowpod_common::defaults::DefaultWorkflowOptions;
use flowpod_common::paths::{self, base_name};

use crate::error::ManifestError;
use crate::fetch::{
    config_map_expand, ssh_fetch, FetchCommand, HttpsFetch, RefSelector, FETCH_ROOT,
    GIT_SECRET_DIR, PACKAGE_CONFIG_MAP_DIR,
};
use crate::migrate::{apply_defaults, migrate_deprecated, rewrite_paths, s3_data_dir, s3_input_dir, S3_ROOT_DIR};
use crate::plan::{config_map_name, ExecutionPlan, PodSettings, CONFIG_FILE_KEY};
use crate::resources::{requirements, ResourceRole};
use crate::source::PackageSource;

// Container names
const PACKAGE_FETCH_CONTAINER: &str = "git-sync-package";
const S3_FETCH_CONTAINER: &str = "s3-fetch";
const PRIMARY_CONTAINER: &str = "elaunch-primary";
const MONITOR_CONTAINER: &str = "monitor-elaunch-container";

// Volume names
const CONFIG_VOLUME: &str = "config-volume";
const GIT_SECRET_VOLUME: &str = "git-secrets-package";
const GIT_SYNC_CONFIG: &str = "git-sync-config";
const PACKAGE_VOLUME: &str = "git-sync-package";
const TMP_VOLUME: &str = "tmp-volume-name";
const S3_FETCH_VOLUME: &str = "s3-fetch";

const WORKDIR: &str = "/tmp/workdir";
const CONFIG_FILE_PATH: &str = "/etc/podinfo/flow-k8s-conf.yml";
const DEFAULT_PACKAGE_MOUNT: &str = "/mnt/package";
const DEFAULT_LAUNCHER: &str = "elaunch.py";
const CONFIG_MAP_PACKAGE: &str = "lambda.package";
const S3_FETCH_WORKDIR: &str = "/workdir";
const PULL_ALWAYS: &str = "Always";
/// 0440: owner and group may read the git credentials
const GIT_SECRET_MODE: i32 = 288;
const TERMINATION_GRACE_SECONDS: i64 = 600;

/// S3 environment variables and their keys in a dataset secret, in order
const S3_CREDENTIALS: [(&str, &str); 5] = [
    ("S3_ACCESS_KEY_ID", "accessKeyID"),
    ("S3_SECRET_ACCESS_KEY", "secretAccessKey"),
    ("S3_ENDPOINT", "endpoint"),
    ("S3_BUCKET", "bucket"),
    ("S3_REGION", "region"),
];

/// Compiles a Workflow into an [`ExecutionPlan`]
pub struct ManifestCompiler<'a> {
    workflow: &'a Workflow,
    defaults: &'a DefaultWorkflowOptions,
    env: &'a OperatorEnv,
}

/// Mounts shared between several containers of the pod
struct SharedMounts {
    config: VolumeMount,
    passwd: VolumeMount,
    tmp: VolumeMount,
    working: VolumeMount,
}

impl<'a> ManifestCompiler<'a> {
    pub fn new(
        workflow: &'a Workflow,
        defaults: &'a DefaultWorkflowOptions,
        env: &'a OperatorEnv,
    ) -> Self {
        Self {
            workflow,
            defaults,
            env,
        }
    }

    /// Classify the package source, normalize a copy of the spec, and build
    /// the plan
    pub fn compile(&self) -> Result<ExecutionPlan, ManifestError> {
        let name = self.workflow.name_any();
        let mut spec = self.workflow.spec.clone();

        let source = PackageSource::classify(&spec)?;
        debug!(workflow = %name, source = %source.kind(), "classified package source");

        apply_defaults(&mut spec, self.defaults, source.kind());
        migrate_deprecated(&mut spec);
        rewrite_paths(&mut spec);

        let working_volume = spec
            .working_volume
            .clone()
            .ok_or_else(|| ManifestError::incomplete("spec.workingVolume is not set"))?;
        let package = spec.package.clone().unwrap_or_default();
        let git_secret = non_empty(&package.git_secret).map(str::to_string);
        let package_mount = non_empty(&package.mount)
            .unwrap_or(DEFAULT_PACKAGE_MOUNT)
            .to_string();

        let mounts = SharedMounts {
            config: VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_FILE_PATH.to_string(),
                sub_path: Some(CONFIG_FILE_KEY.to_string()),
                ..Default::default()
            },
            passwd: VolumeMount {
                name: GIT_SYNC_CONFIG.to_string(),
                mount_path: "/etc/passwd".to_string(),
                sub_path: Some("passwd".to_string()),
                ..Default::default()
            },
            tmp: mount(TMP_VOLUME, "/tmp"),
            working: mount(&working_volume.name, WORKDIR),
        };

        let volumes = self.volumes(&name, &spec, &source, working_volume, git_secret.as_deref());

        let mut init_containers = Vec::new();
        if source.needs_fetch() {
            init_containers.push(self.package_fetch_container(
                &source,
                &package,
                git_secret.as_deref(),
                &spec,
                &mounts,
            ));
        }
        if let Some(s3) = &spec.s3_bucket_input {
            init_containers.push(self.s3_fetch_container(s3, &spec, &mounts)?);
        }

        let primary = self.primary_container(&spec, &source, &package, &package_mount, &mounts);
        let monitor = self.monitor_container(&spec, &mounts);

        let uid = self.workflow.uid().unwrap_or_default();
        let mut labels = BTreeMap::from([
            ("workflow".to_string(), name.clone()),
            ("rest-uid".to_string(), uid),
        ]);
        labels.extend(self.workflow.labels().clone());

        let plan = ExecutionPlan {
            name: name.clone(),
            namespace: self.workflow.namespace(),
            labels,
            owner_reference: self.workflow.controller_owner_ref(&()),
            init_containers,
            primary,
            monitor,
            volumes,
            settings: PodSettings {
                service_account_name: self.env.service_account_name.clone(),
                restart_policy: "Never".to_string(),
                termination_grace_period_seconds: TERMINATION_GRACE_SECONDS,
                security_context: PodSecurityContext {
                    fs_group: Some(self.env.fs_group),
                    run_as_user: Some(self.env.user_id),
                    run_as_group: Some(self.env.group_id),
                    ..Default::default()
                },
                image_pull_secrets: spec.image_pull_secrets.clone(),
            },
        };

        info!(
            workflow = %name,
            source = %source.kind(),
            init_containers = plan.init_containers.len(),
            volumes = plan.volumes.len(),
            "compiled workflow"
        );
        Ok(plan)
    }

    fn volumes(
        &self,
        name: &str,
        spec: &WorkflowSpec,
        source: &PackageSource,
        working_volume: Volume,
        git_secret: Option<&str>,
    ) -> Vec<Volume> {
        let mut volumes = spec.volumes.clone();
        volumes.push(config_map_volume(CONFIG_VOLUME, &config_map_name(name)));
        volumes.push(working_volume);

        if let Some(secret) = git_secret {
            volumes.push(Volume {
                name: GIT_SECRET_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    default_mode: Some(GIT_SECRET_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        volumes.push(config_map_volume(GIT_SYNC_CONFIG, GIT_SYNC_CONFIG));

        if let PackageSource::ConfigMap { name } = source {
            volumes.push(config_map_volume(name, name));
        }

        volumes.push(empty_dir(PACKAGE_VOLUME));
        volumes.push(empty_dir(TMP_VOLUME));

        if spec.s3_bucket_input.is_some() {
            volumes.push(empty_dir(S3_FETCH_VOLUME));
        }

        volumes
    }

    fn init_security_context(&self) -> SecurityContext {
        SecurityContext {
            run_as_user: Some(self.env.user_id),
            run_as_group: Some(self.env.user_id),
            ..Default::default()
        }
    }

    fn package_fetch_container(
        &self,
        source: &PackageSource,
        package: &PackageRef,
        git_secret: Option<&str>,
        spec: &WorkflowSpec,
        shared: &SharedMounts,
    ) -> Container {
        let branch = non_empty(&package.branch);
        let commit = non_empty(&package.commit_id);

        let mut mounts = vec![mount(PACKAGE_VOLUME, FETCH_ROOT), shared.passwd.clone()];

        let fetch = match source {
            PackageSource::Https { url, host, path } => HttpsFetch::new(
                url,
                host,
                path,
                git_secret.is_some(),
                RefSelector::commit_first(branch, commit),
            )
            .command(),
            PackageSource::Ssh { url } => ssh_fetch(url, &RefSelector::branch_first(branch, commit)),
            PackageSource::ConfigMap { name } => {
                mounts.push(mount(name, PACKAGE_CONFIG_MAP_DIR));
                config_map_expand()
            }
            PackageSource::FromPath | PackageSource::Instance { .. } => FetchCommand {
                command: None,
                args: Vec::new(),
            },
        };

        if git_secret.is_some() {
            mounts.push(mount(GIT_SECRET_VOLUME, GIT_SECRET_DIR));
        }

        Container {
            name: PACKAGE_FETCH_CONTAINER.to_string(),
            image: Some(self.defaults.git_sync_image.clone()),
            command: fetch.command,
            args: Some(fetch.args),
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            resources: Some(requirements(
                ResourceRole::PackageFetch,
                spec.resources.as_ref(),
            )),
            security_context: Some(self.init_security_context()),
            volume_mounts: Some(mounts),
            ..Default::default()
        }
    }

    fn s3_fetch_container(
        &self,
        s3: &S3BucketInput,
        spec: &WorkflowSpec,
        shared: &SharedMounts,
    ) -> Result<Container, ManifestError> {
        let mut env = vec![EnvVar {
            name: "ROOT_OUTPUT".to_string(),
            value: Some(S3_ROOT_DIR.to_string()),
            ..Default::default()
        }];
        env.extend(s3_credentials_env(s3)?);

        let input_prefix = format!("{}/", s3_input_dir());
        let data_prefix = format!("{}/", s3_data_dir());
        let mut args = Vec::new();
        for (flag, prefix, entries) in [
            ("-i", &input_prefix, &spec.inputs),
            ("-d", &data_prefix, &spec.data),
        ] {
            for rest in entries.iter().filter_map(|p| p.strip_prefix(prefix.as_str())) {
                args.push(flag.to_string());
                args.push(paths::split(rest).source_path);
            }
        }

        Ok(Container {
            name: S3_FETCH_CONTAINER.to_string(),
            image: spec.s3_fetch_files_image.clone(),
            args: Some(args),
            env: Some(env),
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            volume_mounts: Some(vec![
                mount(S3_FETCH_VOLUME, S3_ROOT_DIR),
                shared.passwd.clone(),
            ]),
            resources: Some(requirements(
                ResourceRole::PackageFetch,
                spec.resources.as_ref(),
            )),
            working_dir: Some(S3_FETCH_WORKDIR.to_string()),
            security_context: Some(self.init_security_context()),
            ..Default::default()
        })
    }

    fn primary_container(
        &self,
        spec: &WorkflowSpec,
        source: &PackageSource,
        package: &PackageRef,
        package_mount: &str,
        shared: &SharedMounts,
    ) -> Container {
        let mut env = spec.env.clone();
        let mut command = vec![non_empty(&spec.command)
            .unwrap_or(DEFAULT_LAUNCHER)
            .to_string()];

        for (flag, entries) in [("-i", &spec.inputs), ("-a", &spec.variables), ("-d", &spec.data)] {
            for entry in entries {
                command.push(flag.to_string());
                command.push(entry.clone());
            }
        }
        command.extend(spec.additional_options.iter().cloned());

        let mut package_path = match source {
            PackageSource::Https { url, .. } | PackageSource::Ssh { url } => {
                paths::join([package_mount, base_name(url)])
            }
            PackageSource::ConfigMap { .. } => paths::join([package_mount, CONFIG_MAP_PACKAGE]),
            PackageSource::Instance { name } => {
                env.push(EnvVar {
                    name: "INSTANCE_DIR_NAME".to_string(),
                    value: Some(name.clone()),
                    ..Default::default()
                });
                paths::join([WORKDIR, name.as_str()])
            }
            PackageSource::FromPath => String::new(),
        };

        if let Some(manifest) = non_empty(&package.with_manifest) {
            command.push("--manifest".to_string());
            command.push(relative_to(&package_path, manifest));
        }
        if let Some(from_path) = non_empty(&package.from_path) {
            package_path = relative_to(&package_path, from_path);
        }
        command.push(package_path);

        if spec.debug {
            command.insert(0, "echo".to_string());
        }

        let mut mounts = spec.volume_mounts.clone();
        mounts.extend([
            shared.config.clone(),
            shared.working.clone(),
            mount(PACKAGE_VOLUME, package_mount),
            shared.tmp.clone(),
            shared.passwd.clone(),
        ]);
        if spec.s3_bucket_input.is_some() {
            mounts.push(mount(S3_FETCH_VOLUME, S3_ROOT_DIR));
        }

        Container {
            name: PRIMARY_CONTAINER.to_string(),
            image: spec.image.clone(),
            command: Some(command),
            env: Some(env),
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            volume_mounts: Some(mounts),
            resources: Some(requirements(ResourceRole::Launcher, spec.resources.as_ref())),
            working_dir: Some(WORKDIR.to_string()),
            ..Default::default()
        }
    }

    fn monitor_container(&self, spec: &WorkflowSpec, shared: &SharedMounts) -> Container {
        Container {
            name: MONITOR_CONTAINER.to_string(),
            image: Some(self.defaults.workflow_monitoring_image.clone()),
            env: Some(spec.env.clone()),
            lifecycle: Some(Lifecycle {
                pre_stop: Some(LifecycleHandler {
                    exec: Some(ExecAction {
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            "sleep 10".to_string(),
                        ]),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            resources: Some(requirements(ResourceRole::Monitor, spec.resources.as_ref())),
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            volume_mounts: Some(vec![
                shared.working.clone(),
                shared.tmp.clone(),
                shared.config.clone(),
                shared.passwd.clone(),
            ]),
            ..Default::default()
        }
    }
}

/// `path` unchanged when absolute or when there is no base, else joined onto `base`
fn relative_to(base: &str, path: &str) -> String {
    if base.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        paths::join([base, path])
    }
}

/// S3 credential env vars, in [`S3_CREDENTIALS`] order
fn s3_credentials_env(s3: &S3BucketInput) -> Result<Vec<EnvVar>, ManifestError> {
    let explicit: [(&str, &S3InputVariable); 5] = [
        ("accessKeyID", &s3.access_key_id),
        ("secretAccessKey", &s3.secret_access_key),
        ("endpoint", &s3.endpoint),
        ("bucket", &s3.bucket),
        ("region", &s3.region),
    ];

    for (field, variable) in &explicit {
        if non_empty(&variable.value).is_some() && variable.value_from.is_some() {
            return Err(ManifestError::conflict(format!(
                "spec.s3BucketInput.{field} sets both value and valueFrom"
            )));
        }
    }

    if let Some(dataset) = non_empty(&s3.dataset) {
        if let Some((field, _)) = explicit.iter().find(|(_, v)| v.is_set()) {
            return Err(ManifestError::conflict(format!(
                "spec.s3BucketInput.dataset and spec.s3BucketInput.{field} are mutually exclusive"
            )));
        }

        return Ok(S3_CREDENTIALS
            .iter()
            .map(|(env_name, key)| EnvVar {
                name: env_name.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: dataset.to_string(),
                        key: key.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect());
    }

    Ok(S3_CREDENTIALS
        .iter()
        .zip(explicit.iter())
        .map(|((env_name, _), (_, variable))| EnvVar {
            name: env_name.to_string(),
            value: non_empty(&variable.value).map(str::to_string),
            value_from: variable.value_from.clone(),
        })
        .collect())
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

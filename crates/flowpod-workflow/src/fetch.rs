//! Package-fetch command templates
//!
//! The package-fetch init container runs one of three programs depending on
//! the package source:
//! - https: a `/bin/sh -c` script cloning with plain git
//! - ssh: the git-sync image's own entrypoint, configured with flags
//! - configMap: the package expander shipped in the git-sync image
//!
//! Everything is written below [`FETCH_ROOT`], which is the same emptyDir the
//! primary container mounts as its package directory.

use std::borrow::Cow;

use flowpod_common::paths::base_name;

/// Where the package-fetch container writes the package
pub const FETCH_ROOT: &str = "/tmp/git";
/// Mount path of the git credentials secret
pub const GIT_SECRET_DIR: &str = "/etc/git-secret";
/// Mount path of the inline package ConfigMap
pub const PACKAGE_CONFIG_MAP_DIR: &str = "/etc/flowir_package";

const OAUTH_TOKEN_FILE: &str = "/etc/git-secret/oauth-token";
const SSH_KEY_FILE: &str = "/etc/git-secret/ssh";
const EXPAND_PACKAGE: &str = "/bin/expand_package.py";

/// Command and arguments for the package-fetch container.
///
/// `command` is `None` when the image entrypoint should be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCommand {
    pub command: Option<Vec<String>>,
    pub args: Vec<String>,
}

/// Which revision of a git remote to check out
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefSelector {
    Commit(String),
    Branch(String),
    DefaultBranch,
}

impl RefSelector {
    /// Selector for an https clone: a commit pins the checkout even when a
    /// branch is also named
    pub fn commit_first(branch: Option<&str>, commit: Option<&str>) -> Self {
        match (commit, branch) {
            (Some(c), _) => RefSelector::Commit(c.to_string()),
            (None, Some(b)) => RefSelector::Branch(b.to_string()),
            (None, None) => RefSelector::DefaultBranch,
        }
    }

    /// Selector for git-sync: a branch takes precedence over a commit
    pub fn branch_first(branch: Option<&str>, commit: Option<&str>) -> Self {
        match (branch, commit) {
            (Some(b), _) => RefSelector::Branch(b.to_string()),
            (None, Some(c)) => RefSelector::Commit(c.to_string()),
            (None, None) => RefSelector::DefaultBranch,
        }
    }
}

/// Shell script that clones an https git remote into the fetch root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpsFetch {
    pub destination: String,
    pub url: String,
    /// `host/path` of the remote, used to splice in the OAuth token
    pub host_path: String,
    /// Read the OAuth token from the mounted git secret
    pub credential: bool,
    pub selector: RefSelector,
}

impl HttpsFetch {
    pub fn new(
        url: &str,
        host: &str,
        path: &str,
        credential: bool,
        selector: RefSelector,
    ) -> Self {
        Self {
            destination: format!("{FETCH_ROOT}/{}", base_name(url)),
            url: url.to_string(),
            host_path: format!("{host}/{path}"),
            credential,
            selector,
        }
    }

    /// Render the script.
    ///
    /// The origin remote is removed at the end so the token never stays in
    /// the checkout's git config.
    pub fn render(&self) -> String {
        let dest = shell_quote(&self.destination);
        let remote = if self.credential {
            format!(
                "https://`cat {OAUTH_TOKEN_FILE}`@{}",
                shell_quote(&self.host_path)
            )
        } else {
            shell_quote(&self.url).into_owned()
        };

        let mut script = match &self.selector {
            RefSelector::Commit(commit) => format!(
                "mkdir -p {dest} && cd {dest} && git init . && git remote add origin {remote} \
                 && git fetch --depth 1 origin {} && git checkout FETCH_HEAD",
                shell_quote(commit)
            ),
            RefSelector::Branch(branch) => format!(
                "git clone --recurse-submodules --depth=1 {remote} {dest} --branch={}",
                shell_quote(branch)
            ),
            RefSelector::DefaultBranch => {
                format!("git clone --recurse-submodules --depth=1 {remote} {dest}")
            }
        };

        script.push_str(&format!(
            " && git -C {dest} submodule update --remote && git -C {dest} remote remove origin"
        ));
        script
    }

    pub fn command(&self) -> FetchCommand {
        FetchCommand {
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: vec![self.render()],
        }
    }
}

/// git-sync arguments for a one-shot shallow clone over ssh
pub fn ssh_fetch(url: &str, selector: &RefSelector) -> FetchCommand {
    let mut args: Vec<String> = [
        "--one-time",
        "--depth=1",
        "--root=/tmp/git",
        "--submodules=recursive",
        "--ssh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("--ssh-key-file={SSH_KEY_FILE}"));

    match selector {
        RefSelector::Branch(branch) => args.push(format!("--branch={branch}")),
        RefSelector::Commit(commit) => args.push(format!("--rev={commit}")),
        RefSelector::DefaultBranch => {}
    }

    args.push("--repo".to_string());
    args.push(url.to_string());

    FetchCommand {
        command: None,
        args,
    }
}

/// Expand the inline package from its ConfigMap into the fetch root
pub fn config_map_expand() -> FetchCommand {
    FetchCommand {
        command: Some(vec![EXPAND_PACKAGE.to_string()]),
        args: vec![
            format!("{PACKAGE_CONFIG_MAP_DIR}/package.json"),
            format!("{FETCH_ROOT}/"),
        ],
    }
}

/// Single-quote `value` for `sh` unless it only has safe characters
fn shell_quote(value: &str) -> Cow<'_, str> {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

//! Source control for application workspaces
//!
//! [`SourceControl`] is the seam the workspace syncs through. [`GitSource`]
//! implements it with libgit2: a full clone when the workspace has no history,
//! otherwise a fetch from `origin` followed by a forced checkout of the
//! fetched head.
//!
//! These operations block on the network and the filesystem. Async callers
//! run them on the blocking pool (see [`crate::workspace::Workspace::sync`]).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, CredentialType, FetchOptions, RemoteCallbacks, Repository};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::Error;

/// Where to sync from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRef {
    /// Repository URL
    pub url: String,
    /// Branch, tag or commit; the remote default branch when `None`
    pub revision: Option<String>,
}

impl SourceRef {
    /// Source tracking the remote default branch
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            revision: None,
        }
    }

    /// Pin a revision and return self for chaining
    pub fn at_revision(mut self, revision: Option<impl Into<String>>) -> Self {
        self.revision = revision.map(Into::into);
        self
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.url, rev),
            None => write!(f, "{}", self.url),
        }
    }
}

/// Cooperative cancellation for a blocking sync
///
/// Clones share the flag. Implementations poll it between steps and while
/// objects are transferred, and give up with an error once it is set.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not set
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of the flag to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Clone/pull operations against a workspace directory
///
/// Both sync operations return the commit id checked out afterwards, and
/// stop early with an error once `cancel` is set.
#[cfg_attr(test, automock)]
pub trait SourceControl: Send + Sync {
    /// Whether `path` already holds a repository
    fn has_history(&self, path: &Path) -> bool;

    /// Clone `source` into `path`
    fn clone_repo(&self, source: &SourceRef, path: &Path, cancel: &CancelFlag)
        -> Result<String, Error>;

    /// Fetch from `origin` and check out the latest revision
    fn pull(&self, source: &SourceRef, path: &Path, cancel: &CancelFlag) -> Result<String, Error>;
}

/// Credentials for private repositories
///
/// The file is used as an SSH private key when the server offers key
/// authentication, or read as a token for HTTPS basic authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitCredentials {
    /// SSH key or token file
    pub path: PathBuf,
}

/// libgit2-backed [`SourceControl`]
#[derive(Clone, Debug, Default)]
pub struct GitSource {
    credentials: Option<GitCredentials>,
}

/// libgit2 re-invokes the credentials callback after every rejected attempt
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

impl GitSource {
    /// Source using ambient credentials (ssh-agent, credential helpers)
    pub fn new() -> Self {
        Self::default()
    }

    /// Source using a credentials file
    pub fn with_credentials(mut self, credentials: Option<GitCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    fn fetch_options(&self, cancel: &CancelFlag) -> FetchOptions<'_> {
        let creds_path = self.credentials.as_ref().map(|c| c.path.as_path());
        let mut attempts = 0u32;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed_types| {
            attempts += 1;
            if attempts > MAX_CREDENTIAL_ATTEMPTS {
                return Err(git2::Error::from_str("credentials rejected"));
            }
            let username = username_from_url.unwrap_or("git");

            if allowed_types.contains(CredentialType::SSH_KEY) {
                if let Some(path) = creds_path {
                    return Cred::ssh_key(username, None, path, None);
                }
                return Cred::ssh_key_from_agent(username);
            }

            if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
                if let Some(path) = creds_path {
                    if let Ok(token) = std::fs::read_to_string(path) {
                        return Cred::userpass_plaintext(username, token.trim());
                    }
                }
            }

            Cred::default()
        });

        // returning false aborts the transfer
        let cancel = cancel.clone();
        callbacks.transfer_progress(move |_| !cancel.is_cancelled());

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);
        fetch_options
    }
}

impl SourceControl for GitSource {
    fn has_history(&self, path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    fn clone_repo(
        &self,
        source: &SourceRef,
        path: &Path,
        cancel: &CancelFlag,
    ) -> Result<String, Error> {
        let fail = |e: git2::Error| sync_error(source, path, e);

        check_cancelled(cancel).map_err(fail)?;
        info!(url = %source.url, path = %path.display(), "Cloning repository");
        let mut builder = RepoBuilder::new();
        builder.fetch_options(self.fetch_options(cancel));
        let repo = builder.clone(&source.url, path).map_err(fail)?;

        check_cancelled(cancel).map_err(fail)?;
        if let Some(rev) = &source.revision {
            checkout_revision(&repo, rev).map_err(fail)?;
        }
        head_commit(&repo).map_err(fail)
    }

    fn pull(&self, source: &SourceRef, path: &Path, cancel: &CancelFlag) -> Result<String, Error> {
        let fail = |e: git2::Error| sync_error(source, path, e);

        check_cancelled(cancel).map_err(fail)?;
        let repo = Repository::open(path).map_err(fail)?;
        {
            let remote = repo.find_remote("origin").map_err(fail)?;
            if remote.url() != Some(source.url.as_str()) {
                debug!(
                    from = remote.url().unwrap_or_default(),
                    to = %source.url,
                    "Repository URL changed, repointing origin"
                );
                repo.remote_set_url("origin", &source.url).map_err(fail)?;
            }
        }
        let mut remote = repo.find_remote("origin").map_err(fail)?;
        let mut options = self.fetch_options(cancel);

        match &source.revision {
            Some(rev) => {
                debug!(path = %path.display(), revision = %rev, "Fetching pinned revision");
                remote
                    .fetch(
                        &[
                            "+refs/heads/*:refs/remotes/origin/*",
                            "+refs/tags/*:refs/tags/*",
                        ],
                        Some(&mut options),
                        None,
                    )
                    .map_err(fail)?;
                check_cancelled(cancel).map_err(fail)?;
                checkout_revision(&repo, rev).map_err(fail)?;
            }
            None => {
                let branch = tracked_branch(&repo).map_err(fail)?;
                debug!(path = %path.display(), branch = %branch, "Fetching branch");
                let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
                remote
                    .fetch(&[refspec.as_str()], Some(&mut options), None)
                    .map_err(fail)?;

                check_cancelled(cancel).map_err(fail)?;

                // local edits in the workspace are discarded
                let fetched = repo
                    .find_reference(&format!("refs/remotes/origin/{}", branch))
                    .and_then(|r| r.peel_to_commit())
                    .map_err(fail)?;
                let local = format!("refs/heads/{}", branch);
                repo.reference(&local, fetched.id(), true, "microapp: sync")
                    .map_err(fail)?;
                repo.set_head(&local).map_err(fail)?;
                repo.checkout_head(Some(CheckoutBuilder::new().force()))
                    .map_err(fail)?;
            }
        }

        head_commit(&repo).map_err(fail)
    }
}

fn check_cancelled(cancel: &CancelFlag) -> Result<(), git2::Error> {
    if cancel.is_cancelled() {
        return Err(git2::Error::from_str("sync cancelled"));
    }
    Ok(())
}

fn sync_error(source: &SourceRef, path: &Path, e: git2::Error) -> Error {
    Error::sync_failed(source.url.clone(), path.display().to_string(), e.message())
}

/// Branch the workspace follows when no revision is pinned
///
/// The checked-out branch if HEAD is attached, otherwise the remote's
/// default branch as recorded at clone time.
fn tracked_branch(repo: &Repository) -> Result<String, git2::Error> {
    let head = repo.find_reference("HEAD")?;
    if let Some(target) = head.symbolic_target() {
        if let Some(branch) = target.strip_prefix("refs/heads/") {
            return Ok(branch.to_string());
        }
    }

    let origin_head = repo.find_reference("refs/remotes/origin/HEAD")?;
    origin_head
        .symbolic_target()
        .and_then(|t| t.strip_prefix("refs/remotes/origin/"))
        .map(String::from)
        .ok_or_else(|| git2::Error::from_str("cannot determine the remote default branch"))
}

/// Detach HEAD at `rev`, preferring the remote-tracking branch of that name
fn checkout_revision(repo: &Repository, rev: &str) -> Result<(), git2::Error> {
    let object = repo
        .revparse_single(&format!("origin/{}", rev))
        .or_else(|_| repo.revparse_single(rev))?;
    let commit = object.peel_to_commit()?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(commit.id())?;
    Ok(())
}

fn head_commit(repo: &Repository) -> Result<String, git2::Error> {
    Ok(repo.head()?.peel_to_commit()?.id().to_string())
}

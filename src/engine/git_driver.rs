//! All Git and pull-request interaction, expressed as a uniform
//! `{ok, output, error}` result.
//!
//! Clone-or-fetch reuse, branch checkout/create fallback chains, SSH-key
//! push, and `parse_github_url` retarget the usual `git2`-wrapper shape from
//! short-lived agent branch names to `ralph/<slug>-<epoch>` project working
//! branches. `createPullRequest` shells out to the `gh` CLI via
//! `external::command::CommandExecutor` rather than an API client crate,
//! matching the `gh`/`git` shellout style used elsewhere for branch
//! creation and PR operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{BranchType, Cred, Direction, PushOptions, RemoteCallbacks, Repository, Signature};

use crate::external::command::{CommandExecutor, ExecOptions};
use crate::observability::engine_metrics;

#[derive(Debug, Clone)]
pub struct GitResult {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
}

impl GitResult {
    fn ok(output: impl Into<String>) -> Self {
        engine_metrics().record_git_operation();
        Self {
            ok: true,
            output: output.into(),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        engine_metrics().record_git_operation();
        engine_metrics().record_git_failure();
        Self {
            ok: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepoInfo {
    pub owner: String,
    pub repo: String,
}

/// Parse a GitHub remote URL, accepting both SSH (`git@github.com:owner/repo.git`)
/// and HTTPS (`https://github.com/owner/repo.git`) forms.
pub fn parse_github_url(url: &str) -> Option<GitHubRepoInfo> {
    if let Some(path) = url.strip_prefix("git@github.com:") {
        let path = path.strip_suffix(".git").unwrap_or(path);
        let mut parts = path.splitn(2, '/');
        if let (Some(owner), Some(repo)) = (parts.next(), parts.next()) {
            return Some(GitHubRepoInfo {
                owner: owner.to_string(),
                repo: repo.to_string(),
            });
        }
    }

    if let Some(path) = url.strip_prefix("https://github.com/") {
        let path = path.strip_suffix(".git").unwrap_or(path);
        let mut parts = path.splitn(2, '/');
        if let (Some(owner), Some(repo)) = (parts.next(), parts.next()) {
            return Some(GitHubRepoInfo {
                owner: owner.to_string(),
                repo: repo.to_string(),
            });
        }
    }

    None
}

fn ssh_callbacks() -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|_url, username_from_url, _allowed_types| {
        Cred::ssh_key(
            username_from_url.unwrap_or("git"),
            None,
            Path::new(&format!(
                "{}/.ssh/id_rsa",
                std::env::var("HOME").unwrap_or_default()
            )),
            None,
        )
    });
    callbacks
}

/// Git and PR operations against a single working-tree checkout.
pub struct GitDriver {
    executor: Arc<dyn CommandExecutor>,
}

impl GitDriver {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Clone into `checkout_dir`, reusing an existing checkout when possible.
    pub fn clone_or_reuse(&self, checkout_dir: &Path, remote_url: &str) -> GitResult {
        if checkout_dir.join(".git").is_dir() {
            return match Repository::open(checkout_dir) {
                Ok(repo) => self.fetch_prune(&repo, "origin"),
                Err(e) => GitResult::err(format!("failed to open existing checkout: {e}")),
            };
        }

        if checkout_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(checkout_dir) {
                return GitResult::err(format!("failed to remove stale checkout: {e}"));
            }
        }

        if let Some(parent) = checkout_dir.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return GitResult::err(format!("failed to create workspace dir: {e}"));
            }
        }

        let mut builder = git2::build::RepoBuilder::new();
        let mut fetch_options = git2::FetchOptions::new();
        fetch_options.remote_callbacks(ssh_callbacks());
        builder.fetch_options(fetch_options);

        match builder.clone(remote_url, checkout_dir) {
            Ok(_) => GitResult::ok(format!("cloned {remote_url}")),
            Err(e) => GitResult::err(format!("clone failed: {e}")),
        }
    }

    fn fetch_prune(&self, repo: &Repository, remote_name: &str) -> GitResult {
        let mut remote = match repo.find_remote(remote_name) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("remote '{remote_name}' not found: {e}")),
        };
        let mut fetch_options = git2::FetchOptions::new();
        fetch_options.remote_callbacks(ssh_callbacks());
        fetch_options.prune(git2::FetchPrune::On);
        match remote.fetch(&[] as &[&str], Some(&mut fetch_options), None) {
            Ok(_) => GitResult::ok("fetched and pruned"),
            Err(e) => GitResult::err(format!("fetch failed: {e}")),
        }
    }

    /// Try local checkout, fall back to remote tracking checkout, else create from HEAD.
    pub fn checkout_or_create_branch(&self, checkout_dir: &Path, branch: &str) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };

        if let Ok(_branch_ref) = repo.find_branch(branch, BranchType::Local) {
            return self.checkout_ref(&repo, branch);
        }

        if let Ok(remote_branch) = repo.find_branch(&format!("origin/{branch}"), BranchType::Remote) {
            let commit = match remote_branch.get().peel_to_commit() {
                Ok(c) => c,
                Err(e) => return GitResult::err(format!("remote branch has no commit: {e}")),
            };
            if let Err(e) = repo.branch(branch, &commit, false) {
                return GitResult::err(format!("failed to create local tracking branch: {e}"));
            }
            return self.checkout_ref(&repo, branch);
        }

        let head_commit = match repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(c) => c,
            Err(e) => return GitResult::err(format!("HEAD has no commit: {e}")),
        };
        if let Err(e) = repo.branch(branch, &head_commit, false) {
            return GitResult::err(format!("failed to create branch from HEAD: {e}"));
        }
        self.checkout_ref(&repo, branch)
    }

    /// Resume semantics: if `working_branch` exists remotely, check it out and pull;
    /// otherwise create it fresh from `base_branch` after pulling the base up to date.
    pub fn create_working_branch(
        &self,
        checkout_dir: &Path,
        working_branch: &str,
        base_branch: &str,
    ) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };

        if repo
            .find_branch(&format!("origin/{working_branch}"), BranchType::Remote)
            .is_ok()
        {
            let checkout = self.checkout_or_create_branch(checkout_dir, working_branch);
            if !checkout.ok {
                return checkout;
            }
            return self.fast_forward_pull(&repo, working_branch);
        }

        let base_checkout = self.checkout_or_create_branch(checkout_dir, base_branch);
        if !base_checkout.ok {
            return base_checkout;
        }
        let pulled = self.fast_forward_pull(&repo, base_branch);
        if !pulled.ok {
            return pulled;
        }

        let head_commit = match repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(c) => c,
            Err(e) => return GitResult::err(format!("HEAD has no commit: {e}")),
        };
        if let Err(e) = repo.branch(working_branch, &head_commit, false) {
            return GitResult::err(format!("failed to create working branch: {e}"));
        }
        self.checkout_ref(&repo, working_branch)
    }

    fn checkout_ref(&self, repo: &Repository, branch: &str) -> GitResult {
        let branch_ref = match repo
            .find_branch(branch, BranchType::Local)
            .map(|b| b.into_reference())
        {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("branch '{branch}' not found: {e}")),
        };

        let target = match branch_ref.target() {
            Some(t) => t,
            None => return GitResult::err("branch has no target commit".to_string()),
        };

        let commit = match repo.find_commit(target) {
            Ok(c) => c,
            Err(e) => return GitResult::err(format!("failed to resolve commit: {e}")),
        };
        let tree = match commit.tree() {
            Ok(t) => t,
            Err(e) => return GitResult::err(format!("failed to resolve tree: {e}")),
        };

        let ref_name = match branch_ref.name() {
            Some(n) => n.to_string(),
            None => return GitResult::err("branch reference has no name".to_string()),
        };

        if let Err(e) = repo.set_head(&ref_name) {
            return GitResult::err(format!("failed to set HEAD: {e}"));
        }
        if let Err(e) = repo.checkout_tree(tree.as_object(), None) {
            return GitResult::err(format!("checkout failed: {e}"));
        }
        GitResult::ok(format!("checked out {branch}"))
    }

    fn fast_forward_pull(&self, repo: &Repository, branch: &str) -> GitResult {
        if let Err(e) = self.fetch_prune_checked(repo, "origin") {
            return GitResult::err(e);
        }
        let remote_ref = format!("origin/{branch}");
        let remote_branch = match repo.find_branch(&remote_ref, BranchType::Remote) {
            Ok(b) => b,
            // No remote counterpart yet (branch not pushed) is not an error.
            Err(_) => return GitResult::ok("no remote counterpart, nothing to pull"),
        };
        let remote_commit = match remote_branch.get().peel_to_commit() {
            Ok(c) => c,
            Err(e) => return GitResult::err(format!("remote branch has no commit: {e}")),
        };

        let mut local_ref = match repo.find_reference(&format!("refs/heads/{branch}")) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("local branch ref missing: {e}")),
        };
        if let Err(e) = local_ref.set_target(remote_commit.id(), "fast-forward pull") {
            return GitResult::err(format!("fast-forward failed: {e}"));
        }
        let tree = match remote_commit.tree() {
            Ok(t) => t,
            Err(e) => return GitResult::err(format!("failed to resolve tree: {e}")),
        };
        if let Err(e) = repo.checkout_tree(tree.as_object(), Some(git2::build::CheckoutBuilder::new().force())) {
            return GitResult::err(format!("checkout after pull failed: {e}"));
        }
        GitResult::ok(format!("pulled {branch}"))
    }

    fn fetch_prune_checked(&self, repo: &Repository, remote_name: &str) -> Result<(), String> {
        let result = self.fetch_prune(repo, remote_name);
        if result.ok {
            Ok(())
        } else {
            Err(result.error.unwrap_or_else(|| "fetch failed".to_string()))
        }
    }

    /// Stage all, no-op on a clean tree, commit with a co-author trailer.
    pub fn commit(&self, checkout_dir: &Path, message: &str) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };

        let mut index = match repo.index() {
            Ok(i) => i,
            Err(e) => return GitResult::err(format!("failed to open index: {e}")),
        };
        if let Err(e) = index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None) {
            return GitResult::err(format!("failed to stage changes: {e}"));
        }
        if let Err(e) = index.write() {
            return GitResult::err(format!("failed to write index: {e}"));
        }

        let statuses = match repo.statuses(None) {
            Ok(s) => s,
            Err(e) => return GitResult::err(format!("failed to read status: {e}")),
        };
        if statuses.is_empty() {
            return GitResult::ok("working tree clean, nothing to commit");
        }

        let tree_id = match index.write_tree() {
            Ok(t) => t,
            Err(e) => return GitResult::err(format!("failed to write tree: {e}")),
        };
        let tree = match repo.find_tree(tree_id) {
            Ok(t) => t,
            Err(e) => return GitResult::err(format!("failed to resolve tree: {e}")),
        };
        let signature = match repo
            .signature()
            .or_else(|_| Signature::now("ralphd", "ralphd@localhost"))
        {
            Ok(s) => s,
            Err(e) => return GitResult::err(format!("failed to build signature: {e}")),
        };
        let parent = match repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(c) => c,
            Err(e) => return GitResult::err(format!("HEAD has no commit: {e}")),
        };

        let full_message = format!("{message}\n\nCo-authored-by: ralphd agent <agent@ralphd.local>");
        match repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &full_message,
            &tree,
            &[&parent],
        ) {
            Ok(oid) => GitResult::ok(format!("committed {oid}")),
            Err(e) => GitResult::err(format!("commit failed: {e}")),
        }
    }

    /// If the branch exists remotely, pull --rebase first, then push with upstream.
    pub fn push(&self, checkout_dir: &Path, branch: &str) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };

        if self.remote_branch_exists(checkout_dir, branch).ok {
            let pull = self.fast_forward_pull(&repo, branch);
            if !pull.ok {
                return pull;
            }
        }

        let mut remote = match repo.find_remote("origin") {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("remote 'origin' not found: {e}")),
        };

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(ssh_callbacks());

        match remote.push(&[&refspec], Some(&mut push_options)) {
            Ok(_) => GitResult::ok(format!("pushed {branch}")),
            Err(e) => GitResult::err(format!("push failed: {e}")),
        }
    }

    pub fn remote_branch_exists(&self, checkout_dir: &Path, branch: &str) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };
        if let Err(e) = self.fetch_prune_checked(&repo, "origin") {
            return GitResult::err(e);
        }
        match repo.find_branch(&format!("origin/{branch}"), BranchType::Remote) {
            Ok(_) => GitResult::ok("true"),
            Err(_) => GitResult::ok("false"),
        }
    }

    pub fn get_current_branch(&self, checkout_dir: &Path) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };
        match repo.head() {
            Ok(head) => match head.shorthand() {
                Some(name) => GitResult::ok(name.to_string()),
                None => GitResult::err("HEAD is detached or unnamed".to_string()),
            },
            Err(e) => GitResult::err(format!("failed to read HEAD: {e}")),
        }
    }

    pub fn get_diff(&self, checkout_dir: &Path) -> GitResult {
        self.get_diff_against(checkout_dir, None)
    }

    pub fn get_diff_from_base(&self, checkout_dir: &Path, base_branch: &str) -> GitResult {
        self.get_diff_against(checkout_dir, Some(base_branch))
    }

    fn get_diff_against(&self, checkout_dir: &Path, base: Option<&str>) -> GitResult {
        let repo = match Repository::open(checkout_dir) {
            Ok(r) => r,
            Err(e) => return GitResult::err(format!("failed to open repo: {e}")),
        };

        let old_tree = match base {
            Some(base_branch) => {
                let obj = match repo.revparse_single(base_branch) {
                    Ok(o) => o,
                    Err(e) => return GitResult::err(format!("failed to resolve '{base_branch}': {e}")),
                };
                match obj.peel_to_tree() {
                    Ok(t) => Some(t),
                    Err(e) => return GitResult::err(format!("failed to resolve base tree: {e}")),
                }
            }
            None => match repo.head().and_then(|h| h.peel_to_tree()) {
                Ok(t) => Some(t),
                Err(e) => return GitResult::err(format!("failed to resolve HEAD tree: {e}")),
            },
        };

        let diff = match repo.diff_tree_to_workdir_with_index(old_tree.as_ref(), None) {
            Ok(d) => d,
            Err(e) => return GitResult::err(format!("diff failed: {e}")),
        };

        let mut output = String::new();
        let print_result = diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            if let Ok(s) = std::str::from_utf8(line.content()) {
                output.push_str(s);
            }
            true
        });
        match print_result {
            Ok(_) => GitResult::ok(output),
            Err(e) => GitResult::err(format!("diff rendering failed: {e}")),
        }
    }

    pub fn cleanup_workspace(&self, checkout_dir: &Path) -> GitResult {
        if !checkout_dir.exists() {
            return GitResult::ok("nothing to clean up");
        }
        match std::fs::remove_dir_all(checkout_dir) {
            Ok(_) => GitResult::ok(format!("removed {}", checkout_dir.display())),
            Err(e) => GitResult::err(format!("cleanup failed: {e}")),
        }
    }

    /// `gh pr create`, run with `NO_COLOR`/`FORCE_COLOR` pinned so output parses cleanly.
    pub async fn create_pull_request(
        &self,
        checkout_dir: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> GitResult {
        let args = ["pr", "create", "--title", title, "--body", body, "--base", base];
        let options = ExecOptions {
            working_dir: Some(PathBuf::from(checkout_dir)),
            env: vec![
                ("NO_COLOR".to_string(), "1".to_string()),
                ("FORCE_COLOR".to_string(), "0".to_string()),
            ],
        };

        match self
            .executor
            .execute_with_options("gh", &args, &options)
            .await
        {
            Ok(output) if output.success() => GitResult::ok(output.stdout),
            Ok(output) => GitResult::err(output.stderr),
            Err(e) => GitResult::err(format!("failed to invoke gh: {e}")),
        }
    }
}

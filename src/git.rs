//! Per-task commits.
//!
//! When a task's last phase passes its checks the whole working tree is
//! committed on `HEAD`, like `git add -A && git commit`.

use anyhow::{Context, Result};
use git2::{Commit, IndexAddOption, Repository, Signature};
use std::path::Path;
use tracing::{debug, info};

const FALLBACK_AUTHOR: &str = "forge-exec";
const FALLBACK_EMAIL: &str = "forge-exec@localhost";

/// `forge(<plan>): <task-id> <name>`, whitespace in the name collapsed.
pub fn task_commit_message(plan_id: &str, task_id: &str, task_name: &str) -> String {
    let name = task_name.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        format!("forge({}): {}", plan_id, task_id)
    } else {
        format!("forge({}): {} {}", plan_id, task_id, name)
    }
}

/// Stage additions, modifications and deletions under the repository that
/// contains `root`, then commit on `HEAD`. Returns the commit sha.
///
/// When the staged tree equals `HEAD`'s tree nothing is committed and the
/// `HEAD` sha is returned.
pub fn commit_all(root: &Path, message: &str) -> Result<String> {
    let repo = Repository::discover(root)
        .with_context(|| format!("Failed to open git repository at {}", root.display()))?;

    let mut index = repo.index().context("Failed to read git index")?;
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .context("Failed to stage changes")?;
    index
        .update_all(["*"].iter(), None)
        .context("Failed to stage deletions")?;
    index.write().context("Failed to write git index")?;

    let tree_id = index.write_tree().context("Failed to write tree")?;
    let tree = repo.find_tree(tree_id)?;
    let parent = head_commit(&repo);

    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        debug!(sha = %parent.id(), "working tree unchanged; reusing HEAD");
        return Ok(parent.id().to_string());
    }

    let signature = repo
        .signature()
        .or_else(|_| Signature::now(FALLBACK_AUTHOR, FALLBACK_EMAIL))
        .context("Failed to build commit signature")?;
    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    let id = repo
        .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .context("Failed to create commit")?;

    info!(sha = %id, message, "committed task");
    Ok(id.to_string())
}

/// The HEAD commit, or `None` on an unborn branch.
fn head_commit(repo: &Repository) -> Option<Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

//! Version control access through the `git` command line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::graph::{normalize_email, ChangeKind};

const FIELD_SEP: char = '\u{1f}';

/// How one commit changed one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// Source path of a rename
    pub previous_path: Option<String>,
    pub change: ChangeKind,
    pub additions: u32,
    pub deletions: u32,
}

/// One commit as read from the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub revision: String,
    pub parents: Vec<String>,
    pub author_name: String,
    /// Normalized (trimmed, lower-cased)
    pub author_email: String,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    pub subject: String,
    pub body: String,
    pub changes: Vec<FileChange>,
}

impl CommitRecord {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// Read access to a repository's commit graph.
#[async_trait]
pub trait VcsSource: Send + Sync {
    /// Current head revision, `None` for a repository without commits.
    async fn head(&self) -> Result<Option<String>>;

    async fn contains_revision(&self, revision: &str) -> Result<bool>;

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Commits reachable from `head` but not from `since`, parents first.
    async fn commits_since(&self, since: Option<&str>, head: &str) -> Result<Vec<CommitRecord>>;
}

/// [`VcsSource`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.root).args(args);
        cmd
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command(args)
            .output()
            .await
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        String::from_utf8(output.stdout).context("invalid utf-8 in git output")
    }

    /// Exit code of a git invocation used as a predicate.
    async fn status(&self, args: &[&str]) -> Result<Option<i32>> {
        let output = self
            .command(args)
            .output()
            .await
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;
        Ok(output.status.code())
    }

    async fn read_commit(&self, revision: &str) -> Result<CommitRecord> {
        let format = format!(
            "--format=%H{0}%P{0}%an{0}%ae{0}%aI{0}%cI{0}%B",
            FIELD_SEP
        );
        let metadata = self
            .run(&["show", "--quiet", "--no-color", &format, revision])
            .await?;
        let numstat = self
            .run(&[
                "show",
                "--no-color",
                "--numstat",
                "--format=",
                "--find-renames",
                "--find-copies",
                revision,
            ])
            .await?;
        let name_status = self
            .run(&[
                "show",
                "--no-color",
                "--name-status",
                "--format=",
                "--find-renames",
                "--find-copies",
                revision,
            ])
            .await?;

        let mut record = parse_metadata(&metadata)
            .with_context(|| format!("unable to parse commit metadata for {}", revision))?;
        record.changes = merge_changes(parse_name_status(&name_status), parse_numstat(&numstat));
        debug!(
            "Read commit {} ({} files)",
            record.revision,
            record.changes.len()
        );
        Ok(record)
    }
}

#[async_trait]
impl VcsSource for GitCli {
    async fn head(&self) -> Result<Option<String>> {
        match self.status(&["rev-parse", "--verify", "--quiet", "HEAD"]).await? {
            Some(0) => {
                let head = self.run(&["rev-parse", "HEAD"]).await?;
                Ok(Some(head.trim().to_string()))
            }
            _ => {
                // no commits yet, but it must still be a repository
                self.run(&["rev-parse", "--git-dir"]).await?;
                Ok(None)
            }
        }
    }

    async fn contains_revision(&self, revision: &str) -> Result<bool> {
        let object = format!("{}^{{commit}}", revision);
        Ok(self.status(&["cat-file", "-e", &object]).await? == Some(0))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        match self
            .status(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?
        {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => bail!(
                "git merge-base --is-ancestor {} {} exited with {:?}",
                ancestor,
                descendant,
                code
            ),
        }
    }

    async fn commits_since(&self, since: Option<&str>, head: &str) -> Result<Vec<CommitRecord>> {
        let range = match since {
            Some(since) => format!("{}..{}", since, head),
            None => head.to_string(),
        };
        let listing = self
            .run(&["rev-list", "--reverse", "--topo-order", &range])
            .await?;

        let mut records = Vec::new();
        for revision in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            records.push(self.read_commit(revision).await?);
        }
        Ok(records)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("invalid timestamp {:?}", raw))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Split a commit message into subject line and body.
fn split_message(message: &str) -> (String, String) {
    let stripped = message.trim_matches('\n');
    let mut lines = stripped.lines();
    let subject = lines.next().unwrap_or_default().trim().to_string();
    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    (subject, body)
}

/// Parse `show --format=%H␟%P␟%an␟%ae␟%aI␟%cI␟%B` output.
fn parse_metadata(output: &str) -> Result<CommitRecord> {
    let parts: Vec<&str> = output.splitn(7, FIELD_SEP).collect();
    let [revision, parents, name, email, authored, committed, message] = parts.as_slice() else {
        bail!("expected 7 fields, got {}", parts.len());
    };
    let (subject, body) = split_message(message);
    Ok(CommitRecord {
        revision: revision.trim().to_string(),
        parents: parents.split_whitespace().map(str::to_string).collect(),
        author_name: name.trim().to_string(),
        author_email: normalize_email(email),
        authored_at: parse_timestamp(authored)?,
        committed_at: parse_timestamp(committed)?,
        subject,
        body,
        changes: Vec::new(),
    })
}

/// Destination path of a numstat rename entry.
///
/// `src/{old => new}/x.py` becomes `src/new/x.py`, `a.py => b.py` becomes
/// `b.py`.
fn rename_target(path: &str) -> String {
    if let (Some(open), Some(close)) = (path.find('{'), path.rfind('}')) {
        if open < close {
            let inner = &path[open + 1..close];
            if let Some((_, to)) = inner.split_once(" => ") {
                let joined = format!("{}{}{}", &path[..open], to, &path[close + 1..]);
                return joined.replace("//", "/");
            }
        }
    }
    match path.split_once(" => ") {
        Some((_, to)) => to.to_string(),
        None => path.to_string(),
    }
}

/// Parse `show --numstat` output into path -> (additions, deletions).
/// Binary files (`-`) count zero lines.
fn parse_numstat(output: &str) -> HashMap<String, (u32, u32)> {
    let mut stats = HashMap::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            continue;
        }
        let additions = parts[0].parse().unwrap_or(0);
        let deletions = parts[1].parse().unwrap_or(0);
        let path = rename_target(parts[parts.len() - 1].trim()).replace('\\', "/");
        if !path.is_empty() {
            stats.insert(path, (additions, deletions));
        }
    }
    stats
}

/// Parse `show --name-status` output into (kind, path, previous path).
fn parse_name_status(output: &str) -> Vec<(ChangeKind, String, Option<String>)> {
    let mut rows = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        let status = parts[0].trim().chars().next().unwrap_or('M');
        let (change, path, previous) = match (status, parts.get(2)) {
            ('R', Some(to)) => (ChangeKind::Renamed, *to, Some(parts[1])),
            ('C', Some(to)) => (ChangeKind::Added, *to, None),
            ('A', _) => (ChangeKind::Added, parts[1], None),
            ('D', _) => (ChangeKind::Deleted, parts[1], None),
            _ => (ChangeKind::Modified, parts[1], None),
        };
        let path = path.trim().replace('\\', "/");
        if path.is_empty() {
            continue;
        }
        let previous = previous.map(|p| p.trim().replace('\\', "/"));
        rows.push((change, path, previous));
    }
    rows
}

/// Join name-status rows with line counts. Paths only numstat knows about
/// count as modified.
fn merge_changes(
    name_status: Vec<(ChangeKind, String, Option<String>)>,
    mut numstat: HashMap<String, (u32, u32)>,
) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = name_status
        .into_iter()
        .map(|(change, path, previous_path)| {
            let (additions, deletions) = numstat.remove(&path).unwrap_or((0, 0));
            FileChange {
                path,
                previous_path,
                change,
                additions,
                deletions,
            }
        })
        .collect();

    let mut rest: Vec<(String, (u32, u32))> = numstat.into_iter().collect();
    rest.sort();
    changes.extend(rest.into_iter().map(|(path, (additions, deletions))| FileChange {
        path,
        previous_path: None,
        change: ChangeKind::Modified,
        additions,
        deletions,
    }));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rename_target() {
        assert_eq!(rename_target("src/{old => new}/x.py"), "src/new/x.py");
        assert_eq!(rename_target("src/{ => sub}/x.py"), "src/sub/x.py");
        assert_eq!(rename_target("a.py => b.py"), "b.py");
        assert_eq!(rename_target("plain.py"), "plain.py");
    }

    #[test]
    fn test_parse_numstat() {
        let output = "3\t1\tsrc/app.py\n-\t-\tlogo.png\n2\t0\tpkg/{a.py => b.py}\n";
        let stats = parse_numstat(output);
        assert_eq!(stats.get("src/app.py"), Some(&(3, 1)));
        assert_eq!(stats.get("logo.png"), Some(&(0, 0)));
        assert_eq!(stats.get("pkg/b.py"), Some(&(2, 0)));
    }

    #[test]
    fn test_parse_name_status() {
        let output = "A\tnew.py\nM\tsrc/app.py\nD\told.py\nR087\tpkg/a.py\tpkg/b.py\nC100\tx.py\ty.py\nT\tlink\n";
        let rows = parse_name_status(output);
        assert_eq!(
            rows,
            vec![
                (ChangeKind::Added, "new.py".to_string(), None),
                (ChangeKind::Modified, "src/app.py".to_string(), None),
                (ChangeKind::Deleted, "old.py".to_string(), None),
                (
                    ChangeKind::Renamed,
                    "pkg/b.py".to_string(),
                    Some("pkg/a.py".to_string())
                ),
                (ChangeKind::Added, "y.py".to_string(), None),
                (ChangeKind::Modified, "link".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_merge_changes() {
        let name_status = parse_name_status("M\ta.py\nR100\tb.py\tc.py\n");
        let numstat = parse_numstat("4\t2\ta.py\n0\t0\t{b.py => c.py}\n1\t1\textra.py\n");
        let changes = merge_changes(name_status, numstat);
        assert_eq!(changes.len(), 3);
        assert_eq!((changes[0].additions, changes[0].deletions), (4, 2));
        assert_eq!(changes[1].previous_path.as_deref(), Some("b.py"));
        assert_eq!(changes[2].path, "extra.py");
        assert_eq!(changes[2].change, ChangeKind::Modified);
    }

    #[test]
    fn test_parse_metadata() {
        let raw = [
            "abc123",
            "p1 p2",
            "Ada Lovelace",
            " Ada@Example.COM ",
            "2024-03-01T10:00:00+01:00",
            "2024-03-01T11:00:00+00:00",
            "Merge branch\n\nDetails here.\n",
        ]
        .join(&FIELD_SEP.to_string());
        let record = parse_metadata(&raw).unwrap();
        assert_eq!(record.revision, "abc123");
        assert!(record.is_merge());
        assert_eq!(record.author_email, "ada@example.com");
        assert_eq!(record.subject, "Merge branch");
        assert_eq!(record.body, "Details here.");
        assert_eq!(record.authored_at.to_rfc3339(), "2024-03-01T09:00:00+00:00");
        assert!(parse_metadata("too\u{1f}few").is_err());
    }

    async fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .await
            .unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_git_cli_reads_history() {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q"]).await;
        git(dir.path(), &["config", "user.email", "Dev@Example.com"]).await;
        git(dir.path(), &["config", "user.name", "Dev"]).await;

        let cli = GitCli::new(dir.path());
        assert_eq!(cli.head().await.unwrap(), None);

        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        git(dir.path(), &["add", "."]).await;
        git(dir.path(), &["commit", "-q", "-m", "first"]).await;
        let first = cli.head().await.unwrap().unwrap();

        std::fs::write(dir.path().join("a.py"), "x = 2\ny = 3\n").unwrap();
        git(dir.path(), &["commit", "-q", "-am", "second"]).await;
        let second = cli.head().await.unwrap().unwrap();

        assert!(cli.contains_revision(&first).await.unwrap());
        assert!(!cli.contains_revision("0000000000000000000000000000000000000000").await.unwrap());
        assert!(cli.is_ancestor(&first, &second).await.unwrap());
        assert!(!cli.is_ancestor(&second, &first).await.unwrap());

        let all = cli.commits_since(None, &second).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].revision, first);
        assert_eq!(all[0].author_email, "dev@example.com");
        assert_eq!(all[0].changes[0].change, ChangeKind::Added);

        let newer = cli.commits_since(Some(&first), &second).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].parents, vec![first]);
        assert_eq!(newer[0].changes[0].path, "a.py");
        assert_eq!(
            (newer[0].changes[0].additions, newer[0].changes[0].deletions),
            (2, 1)
        );
    }
}

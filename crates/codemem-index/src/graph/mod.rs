//! Knowledge graph model and store.
//!
//! The graph holds two domains:
//! - code structure: source files, code units, semantic chunks
//! - commit history: commits, authors, file revisions
//!
//! Every node is one of the closed set of [`GraphNode`] variants and is keyed
//! by its natural identity ([`NodeKey`]). All writes go through a
//! [`GraphStore`], which validates them before anything is applied.

mod local;
mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extractor::{Definition, Span, UnitKind};

pub use local::{LocalGraphStore, GRAPH_FILE};
pub use store::{
    ChunkMatch, Direction, GraphStats, GraphStore, HistoryEntry, StoreError, WriteBatch, WriteOp,
    WriteSummary,
};

/// A repository file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Repository-relative path with `/` separators
    pub path: String,
    pub language: String,
    pub fingerprint: String,
    pub synced_at: DateTime<Utc>,
    /// Import references as written, re-resolved when the file set changes
    pub imports: Vec<String>,
    /// Distinct unqualified names the file calls
    pub callees: Vec<String>,
}

/// A class, function or method owned by one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// `path:qualifiedName`
    pub id: String,
    pub path: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: UnitKind,
    pub enclosing_class: Option<String>,
    pub source: String,
    pub docstring: Option<String>,
    pub signature: Option<String>,
    pub parameters: Option<String>,
    pub span: Span,
}

impl CodeUnit {
    pub fn identity(path: &str, qualified_name: &str) -> String {
        format!("{}:{}", path, qualified_name)
    }

    pub fn from_definition(path: &str, def: &Definition) -> Self {
        Self {
            id: Self::identity(path, &def.qualified_name),
            path: path.to_string(),
            name: def.name.clone(),
            qualified_name: def.qualified_name.clone(),
            kind: def.kind,
            enclosing_class: def.enclosing_class.clone(),
            source: def.source.clone(),
            docstring: def.docstring.clone(),
            signature: def.signature.clone(),
            parameters: def.parameters.clone(),
            span: def.span,
        }
    }
}

/// Embedded text describing one code unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChunk {
    pub id: String,
    pub unit_id: String,
    /// Context-prefixed text that was embedded
    pub text: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub repo_id: String,
    pub revision: String,
    pub parents: Vec<String>,
    /// Normalized author email
    pub author_email: String,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    pub subject: String,
    pub body: String,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub repo_id: String,
    /// Normalized email, the identity
    pub email: String,
    /// Latest display name seen
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// How one commit changed one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRevision {
    pub repo_id: String,
    pub revision: String,
    pub path: String,
    pub change: ChangeKind,
    pub previous_path: Option<String>,
    pub additions: u32,
    pub deletions: u32,
}

/// Trimmed, lower-cased email used as author identity.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// The closed set of graph entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphNode {
    SourceFile(SourceFile),
    CodeUnit(CodeUnit),
    SemanticChunk(SemanticChunk),
    Commit(Commit),
    Author(Author),
    FileRevision(FileRevision),
}

impl GraphNode {
    pub fn key(&self) -> NodeKey {
        match self {
            Self::SourceFile(f) => NodeKey::File(f.path.clone()),
            Self::CodeUnit(u) => NodeKey::Unit(u.id.clone()),
            Self::SemanticChunk(c) => NodeKey::Chunk(c.id.clone()),
            Self::Commit(c) => NodeKey::commit(&c.repo_id, &c.revision),
            Self::Author(a) => NodeKey::author(&a.repo_id, &a.email),
            Self::FileRevision(r) => NodeKey::revision(&r.repo_id, &r.revision, &r.path),
        }
    }

    /// Schema checks that need no graph state.
    pub fn validate(&self) -> Result<(), String> {
        fn required(field: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{} must not be empty", field))
            } else {
                Ok(())
            }
        }
        fn relative(path: &str) -> Result<(), String> {
            required("path", path)?;
            if path.starts_with('/') || path.contains('\\') {
                return Err(format!("path must be repository-relative: {}", path));
            }
            Ok(())
        }

        match self {
            Self::SourceFile(f) => {
                relative(&f.path)?;
                required("fingerprint", &f.fingerprint)
            }
            Self::CodeUnit(u) => {
                relative(&u.path)?;
                required("name", &u.name)?;
                let expected = CodeUnit::identity(&u.path, &u.qualified_name);
                if u.id != expected {
                    return Err(format!("unit id {} should be {}", u.id, expected));
                }
                Ok(())
            }
            Self::SemanticChunk(c) => {
                required("chunk id", &c.id)?;
                required("unit id", &c.unit_id)?;
                if c.embedding.is_empty() {
                    return Err(format!("chunk {} has an empty embedding", c.id));
                }
                if c.embedding.iter().any(|v| !v.is_finite()) {
                    return Err(format!("chunk {} has non-finite values", c.id));
                }
                Ok(())
            }
            Self::Commit(c) => {
                required("repo id", &c.repo_id)?;
                required("revision", &c.revision)?;
                required("author email", &c.author_email)
            }
            Self::Author(a) => {
                required("repo id", &a.repo_id)?;
                required("email", &a.email)?;
                if a.email != normalize_email(&a.email) {
                    return Err(format!("author email {} is not normalized", a.email));
                }
                Ok(())
            }
            Self::FileRevision(r) => {
                required("repo id", &r.repo_id)?;
                required("revision", &r.revision)?;
                relative(&r.path)
            }
        }
    }
}

/// Natural identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKey {
    File(String),
    Unit(String),
    Chunk(String),
    Commit {
        repo_id: String,
        revision: String,
    },
    Author {
        repo_id: String,
        email: String,
    },
    Revision {
        repo_id: String,
        revision: String,
        path: String,
    },
}

impl NodeKey {
    pub fn commit(repo_id: &str, revision: &str) -> Self {
        Self::Commit {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
        }
    }

    pub fn author(repo_id: &str, email: &str) -> Self {
        Self::Author {
            repo_id: repo_id.to_string(),
            email: email.to_string(),
        }
    }

    pub fn revision(repo_id: &str, revision: &str, path: &str) -> Self {
        Self::Revision {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
            path: path.to_string(),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            Self::File(_) => NodeType::SourceFile,
            Self::Unit(_) => NodeType::CodeUnit,
            Self::Chunk(_) => NodeType::SemanticChunk,
            Self::Commit { .. } => NodeType::Commit,
            Self::Author { .. } => NodeType::Author,
            Self::Revision { .. } => NodeType::FileRevision,
        }
    }

    /// File path for `File` keys.
    pub fn as_file(&self) -> Option<&str> {
        match self {
            Self::File(path) => Some(path),
            _ => None,
        }
    }

    /// Unit id for `Unit` keys.
    pub fn as_unit(&self) -> Option<&str> {
        match self {
            Self::Unit(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file:{}", path),
            Self::Unit(id) => write!(f, "unit:{}", id),
            Self::Chunk(id) => write!(f, "chunk:{}", id),
            Self::Commit { repo_id, revision } => write!(f, "commit:{}@{}", repo_id, revision),
            Self::Author { repo_id, email } => write!(f, "author:{}/{}", repo_id, email),
            Self::Revision {
                repo_id,
                revision,
                path,
            } => write!(f, "revision:{}@{}:{}", repo_id, revision, path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    SourceFile,
    CodeUnit,
    SemanticChunk,
    Commit,
    Author,
    FileRevision,
}

/// Relationship kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// File -> CodeUnit
    Contains,
    /// File -> File
    Imports,
    /// CodeUnit -> CodeUnit
    Calls,
    /// SemanticChunk -> CodeUnit
    Describes,
    /// Commit -> parent Commit
    Parent,
    /// Commit -> Author
    AuthoredBy,
    /// Commit -> FileRevision
    Touches,
    /// FileRevision -> SourceFile
    VersionOf,
}

impl EdgeKind {
    /// Required (source, target) node types.
    pub fn endpoints(&self) -> (NodeType, NodeType) {
        match self {
            Self::Contains => (NodeType::SourceFile, NodeType::CodeUnit),
            Self::Imports => (NodeType::SourceFile, NodeType::SourceFile),
            Self::Calls => (NodeType::CodeUnit, NodeType::CodeUnit),
            Self::Describes => (NodeType::SemanticChunk, NodeType::CodeUnit),
            Self::Parent => (NodeType::Commit, NodeType::Commit),
            Self::AuthoredBy => (NodeType::Commit, NodeType::Author),
            Self::Touches => (NodeType::Commit, NodeType::FileRevision),
            Self::VersionOf => (NodeType::FileRevision, NodeType::SourceFile),
        }
    }
}

/// A directed, typed edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdge {
    pub kind: EdgeKind,
    pub source: NodeKey,
    pub target: NodeKey,
}

impl GraphEdge {
    pub fn new(kind: EdgeKind, source: NodeKey, target: NodeKey) -> Self {
        Self {
            kind,
            source,
            target,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let (from, to) = self.kind.endpoints();
        if self.source.node_type() != from || self.target.node_type() != to {
            return Err(format!(
                "{:?} edge cannot connect {} to {}",
                self.kind, self.source, self.target
            ));
        }
        Ok(())
    }
}

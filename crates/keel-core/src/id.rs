//! Job identity.
//!
//! A [`JobKey`] names one schedulable unit of work: a repository source, a
//! [`JobRef`] saying what kind of change produced it, and the commit to build.
//! The serialized form doubles as the coordination-store key, so it must
//! round-trip exactly and stay stable across releases.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{Error, Result};

const FIELD_SEPARATOR: char = ':';
const UPDATE_TAG: &str = "update";
const BRANCH_TAG: &str = "branch";

/// A repository known to a code-review system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    /// Identifier of the review system or adapter (e.g. `github`).
    pub id: String,
    /// Repository path within that system (e.g. `acme/widgets`).
    pub path: String,
}

impl Source {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.path)
    }
}

/// A full Git object id (SHA-1 or SHA-256), stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First seven characters, for human-facing messages.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl FromStr for CommitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let valid_len = s.len() == 40 || s.len() == 64;
        if !valid_len || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Parse(format!("malformed commit id: {s:?}")));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for CommitId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

/// What kind of change a job builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRef {
    /// A code-review change targeting a branch. All updates for one target
    /// share a local queue, so only one of them builds at a time.
    Update {
        update_id: String,
        target_branch: String,
    },
    /// A direct push to a branch. Every push is its own queue.
    Branch { branch: String },
}

impl JobRef {
    pub fn update(update_id: impl Into<String>, target_branch: impl Into<String>) -> Self {
        JobRef::Update {
            update_id: update_id.into(),
            target_branch: target_branch.into(),
        }
    }

    pub fn branch(branch: impl Into<String>) -> Self {
        JobRef::Branch {
            branch: branch.into(),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            JobRef::Update { .. } => UPDATE_TAG,
            JobRef::Branch { .. } => BRANCH_TAG,
        }
    }

    /// Competition group: jobs with the same queue id never run concurrently.
    pub fn queue_id(&self, commit: &CommitId) -> String {
        match self {
            JobRef::Update { target_branch, .. } => {
                format!("{UPDATE_TAG}-{}", encode(target_branch))
            }
            JobRef::Branch { branch } => format!("{BRANCH_TAG}-{}-{commit}", encode(branch)),
        }
    }

    /// Instance identity within the reference kind.
    pub fn key(&self) -> &str {
        match self {
            JobRef::Update { update_id, .. } => update_id,
            JobRef::Branch { branch } => branch,
        }
    }

    /// Id used to correlate build-log entries for this reference.
    pub fn canonical_id(&self) -> String {
        format!("{}/{}", self.tag(), self.key())
    }

    /// Branch the job's outcome lands on.
    pub fn target_branch(&self) -> &str {
        match self {
            JobRef::Update { target_branch, .. } => target_branch,
            JobRef::Branch { branch } => branch,
        }
    }
}

impl PartialEq for JobRef {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag() && self.key() == other.key()
    }
}

impl Eq for JobRef {}

impl Hash for JobRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        self.key().hash(state);
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRef::Update {
                update_id,
                target_branch,
            } => write!(f, "update {update_id} -> {target_branch}"),
            JobRef::Branch { branch } => write!(f, "branch {branch}"),
        }
    }
}

/// Identity of one schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey {
    pub source: Source,
    pub job_ref: JobRef,
    pub commit: CommitId,
}

impl JobKey {
    pub fn new(source: Source, job_ref: JobRef, commit: CommitId) -> Self {
        Self {
            source,
            job_ref,
            commit,
        }
    }

    pub fn queue_id(&self) -> String {
        self.job_ref.queue_id(&self.commit)
    }

    pub fn canonical_id(&self) -> String {
        self.job_ref.canonical_id()
    }

    /// Delimited string form, used as store key and cross-process identity.
    ///
    /// Every free-form field is percent-encoded so the separator never
    /// appears inside a field.
    pub fn serialize(&self) -> String {
        let mut parts = vec![
            encode(&self.source.id),
            encode(&self.source.path),
            self.job_ref.tag().to_string(),
        ];
        match &self.job_ref {
            JobRef::Update {
                update_id,
                target_branch,
            } => {
                parts.push(encode(update_id));
                parts.push(encode(target_branch));
            }
            JobRef::Branch { branch } => parts.push(encode(branch)),
        }
        parts.push(self.commit.to_string());
        parts.join(&FIELD_SEPARATOR.to_string())
    }

    pub fn deserialize(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(FIELD_SEPARATOR).collect();
        if parts.len() < 5 {
            return Err(Error::Parse(format!("truncated job key: {s:?}")));
        }

        let source = Source::new(decode(parts[0])?, decode(parts[1])?);
        let (job_ref, commit) = match (parts[2], parts.len()) {
            (UPDATE_TAG, 6) => (JobRef::update(decode(parts[3])?, decode(parts[4])?), parts[5]),
            (BRANCH_TAG, 5) => (JobRef::branch(decode(parts[3])?), parts[4]),
            (UPDATE_TAG | BRANCH_TAG, n) => {
                return Err(Error::Parse(format!(
                    "wrong field count {n} for {} reference in {s:?}",
                    parts[2]
                )));
            }
            (other, _) => {
                return Err(Error::Parse(format!("unknown reference kind: {other:?}")));
            }
        };

        Ok(Self::new(source, job_ref, commit.parse()?))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

impl FromStr for JobKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::deserialize(s)
    }
}

impl TryFrom<String> for JobKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::deserialize(&s)
    }
}

impl From<JobKey> for String {
    fn from(key: JobKey) -> Self {
        key.serialize()
    }
}

fn encode(field: &str) -> String {
    urlencoding::encode(field).into_owned()
}

fn decode(field: &str) -> Result<String> {
    urlencoding::decode(field)
        .map(|s| s.into_owned())
        .map_err(|e| Error::Parse(format!("invalid field encoding {field:?}: {e}")))
}

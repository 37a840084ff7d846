use std::{path::Path, sync::LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

static TARGET_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-a-z0-9/.]+$").expect("target charset regex is valid"));
static SUBDIR_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-_a-zA-Z0-9/]+$").expect("subdir charset regex is valid"));

const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    Staging,
    Publish,
}

impl DeployMode {
    /// Top-level key of a stream record carrying a deployment for this mode.
    pub fn record_key(self) -> &'static str {
        match self {
            DeployMode::Staging => "staging",
            DeployMode::Publish => "publish",
        }
    }
}

/// One desired deployment. Never mutated after validation; a newer intent for
/// the same target replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentIntent {
    target_path: String,
    source_url: String,
    branch: String,
    committer: String,
}

impl DeploymentIntent {
    pub fn new(
        target_path: impl Into<String>,
        source_url: impl Into<String>,
        branch: impl Into<String>,
        committer: impl Into<String>,
    ) -> Self {
        Self {
            target_path: target_path.into(),
            source_url: source_url.into(),
            branch: branch.into(),
            committer: committer.into(),
        }
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn committer(&self) -> &str {
        &self.committer
    }
}

#[derive(Debug, Clone)]
pub struct IntentPolicy {
    pub mode: DeployMode,
    pub trusted_source_prefix: String,
    pub org_domain: String,
    pub protected_targets: Vec<String>,
    pub default_branch: String,
    pub default_pusher: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentRejection {
    #[error("deployment payload is malformed: {0}")]
    MalformedPayload(String),
    #[error("deployment payload has no project")]
    MissingProject,
    #[error("deployment payload has no source")]
    MissingSource,
    #[error("invalid subdir {0:?}")]
    InvalidSubdir(String),
    #[error("refusing to touch protected target {0}")]
    ProtectedTarget(String),
    #[error("invalid deployment dir {0:?}")]
    InvalidTarget(String),
    #[error("invalid source url {0:?}")]
    UntrustedSource(String),
    #[error("invalid branch {0:?}")]
    InvalidBranch(String),
}

#[derive(Debug, Default, Deserialize)]
struct DeployPayload {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    pusher: Option<String>,
    #[serde(default)]
    subdir: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

/// Builds a validated intent from the mode-keyed object of a stream record.
pub fn intent_from_record(
    payload: &Value,
    policy: &IntentPolicy,
) -> Result<DeploymentIntent, IntentRejection> {
    let payload = DeployPayload::deserialize(payload)
        .map_err(|err| IntentRejection::MalformedPayload(err.to_string()))?;

    let project = payload
        .project
        .filter(|project| !project.is_empty())
        .ok_or(IntentRejection::MissingProject)?;
    let source_url = payload
        .source
        .filter(|source| !source.is_empty())
        .ok_or(IntentRejection::MissingSource)?;
    let branch = normalize_branch(payload.branch.as_deref(), &policy.default_branch);
    let committer = payload
        .pusher
        .unwrap_or_else(|| policy.default_pusher.clone());

    let mut target_path = match policy.mode {
        DeployMode::Staging => match payload.profile.as_deref() {
            Some(profile) if !profile.is_empty() => format!("{project}-{profile}"),
            _ => project,
        },
        DeployMode::Publish => match payload.target {
            Some(target) if !target.is_empty() => target,
            _ => format!("{project}.{}", policy.org_domain),
        },
    };

    if let Some(subdir) = payload.subdir.as_deref().filter(|subdir| !subdir.is_empty()) {
        target_path = join_subdir(&target_path, subdir)?;
        tracing::debug!(
            target: "intent",
            target_path = %target_path,
            subdir = %subdir,
            "target_extended_with_subdir"
        );
    }

    let intent = DeploymentIntent::new(target_path, source_url, branch, committer);
    validate_intent(&intent, policy)?;
    Ok(intent)
}

/// Checks that run on every intent before it may reach the queue.
pub fn validate_intent(
    intent: &DeploymentIntent,
    policy: &IntentPolicy,
) -> Result<(), IntentRejection> {
    let target = intent.target_path();
    let top_level = target.split('/').next().unwrap_or_default();
    if policy
        .protected_targets
        .iter()
        .any(|protected| protected == target || protected == top_level)
    {
        return Err(IntentRejection::ProtectedTarget(target.to_string()));
    }

    let domain_suffix = format!(".{}", policy.org_domain);
    let stripped = target.replace(&domain_suffix, "");
    if target.is_empty()
        || target.starts_with('/')
        || target.contains("..")
        || !TARGET_CHARSET.is_match(&stripped)
    {
        return Err(IntentRejection::InvalidTarget(target.to_string()));
    }

    if !intent.source_url().starts_with(&policy.trusted_source_prefix) {
        return Err(IntentRejection::UntrustedSource(
            intent.source_url().to_string(),
        ));
    }

    if !is_valid_branch(intent.branch()) {
        return Err(IntentRejection::InvalidBranch(intent.branch().to_string()));
    }

    Ok(())
}

/// `git check-ref-format --branch` rules; never option-like, as the name is a
/// bare git argument.
fn is_valid_branch(branch: &str) -> bool {
    !branch.is_empty()
        && !branch.starts_with(['-', '/', '.'])
        && !branch.ends_with(['/', '.'])
        && !branch.ends_with(".lock")
        && !branch.contains("..")
        && !branch.contains("//")
        && !branch.contains("@{")
        && !branch.contains("/.")
        && branch != "@"
        && !branch.chars().any(|ch| {
            ch.is_ascii_control() || ch.is_whitespace() || "~^:?*[\\".contains(ch)
        })
}

fn normalize_branch(branch: Option<&str>, default_branch: &str) -> String {
    let branch = branch.unwrap_or(default_branch);
    branch
        .strip_prefix(BRANCH_REF_PREFIX)
        .unwrap_or(branch)
        .to_string()
}

fn join_subdir(target_path: &str, subdir: &str) -> Result<String, IntentRejection> {
    if !SUBDIR_CHARSET.is_match(subdir) {
        return Err(IntentRejection::InvalidSubdir(subdir.to_string()));
    }
    // A rooted subdir would replace the whole target on join.
    let relative = subdir.trim_start_matches('/');
    if relative.is_empty() {
        return Err(IntentRejection::InvalidSubdir(subdir.to_string()));
    }

    Ok(Path::new(target_path)
        .join(relative)
        .to_string_lossy()
        .into_owned())
}

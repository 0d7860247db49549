//! Safety gate in front of a [`Sandbox`].

use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use tracing::warn;

use super::{CommandResult, Sandbox, EXIT_REJECTED};

/// Destructive command patterns, matched case-insensitively against the whole command line.
const STANDARD_PATTERNS: &[(&str, &str)] = &[
    (
        r"\brm\s+(-[a-z]*\s+)*-[a-z]*r[a-z]*f?[a-z]*\s+(-[a-z-]+\s+)*(/|/\*|~|\$HOME)(\s|;|&|\||$)",
        "recursive removal of the filesystem root or home",
    ),
    (
        r"--no-preserve-root",
        "removal without root preservation",
    ),
    (r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:", "fork bomb"),
    (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem creation on a device"),
    (
        r"\bdd\b[^;&|]*\bof=/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk)",
        "raw disk write",
    ),
    (
        r">\s*/dev/(sd|hd|vd|xvd|nvme|mmcblk)[a-z0-9]*",
        "redirect onto a raw disk",
    ),
    (r"\bshred\b[^;&|]*/dev/", "device shredding"),
    (r"\bwipefs\b", "filesystem signature wipe"),
    (r"\bchmod\s+(-[a-z]+\s+)*-r[a-z]*\s+[0-7]{3,4}\s+/(\s|$)", "recursive permission change on root"),
    (r"\b(shutdown|reboot|halt|poweroff)\b", "host power control"),
    (r"\binit\s+[06]\b", "runlevel change"),
];

/// Ordered set of patterns that must never reach a workload.
#[derive(Debug, Clone)]
pub struct Denylist {
    rules: Vec<(Regex, String)>,
}

impl Denylist {
    /// An empty denylist (everything allowed).
    pub fn empty() -> Self {
        Denylist { rules: vec![] }
    }

    /// Wipes, fork bombs, raw disk operations and power control.
    pub fn standard() -> Self {
        let mut list = Denylist::empty();
        for (pattern, reason) in STANDARD_PATTERNS {
            list.rules.push((
                case_insensitive(pattern).expect("standard denylist patterns are valid"),
                reason.to_string(),
            ));
        }
        list
    }

    /// Append a pattern.
    ///
    /// # Errors
    /// When `pattern` is not a valid regular expression.
    pub fn with_pattern(mut self, pattern: &str, reason: impl Into<String>) -> anyhow::Result<Self> {
        let regex = case_insensitive(pattern)
            .with_context(|| format!("invalid denylist pattern '{pattern}'"))?;
        self.rules.push((regex, reason.into()));
        Ok(self)
    }

    /// Reason of the first matching rule, if any.
    pub fn check(&self, command: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(command))
            .map(|(_, reason)| reason.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for Denylist {
    fn default() -> Self {
        Self::standard()
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?i){pattern}"))
}

/// A sandbox that refuses denylisted commands before they are dispatched.
///
/// A refusal is a normal [`CommandResult`] with [`EXIT_REJECTED`] and the reason in
/// stderr; the inner sandbox never sees the command.
#[derive(Debug)]
pub struct Guarded<S> {
    inner: S,
    denylist: Denylist,
}

impl<S: Sandbox> Guarded<S> {
    pub fn new(inner: S, denylist: Denylist) -> Self {
        Guarded { inner, denylist }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn denylist(&self) -> &Denylist {
        &self.denylist
    }
}

impl<S: Sandbox> Sandbox for Guarded<S> {
    fn execute(&mut self, workload: &str, command: &str, timeout: Duration) -> CommandResult {
        if let Some(reason) = self.denylist.check(command) {
            warn!(workload, command, reason, "command rejected by denylist");
            return CommandResult::fault(
                EXIT_REJECTED,
                format!("command rejected: {reason}"),
                Duration::ZERO,
            );
        }
        self.inner.execute(workload, command, timeout)
    }

    fn probe(&mut self, workload: &str) -> anyhow::Result<()> {
        self.inner.probe(workload)
    }
}

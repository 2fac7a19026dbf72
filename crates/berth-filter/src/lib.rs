//! berth-filter: decides which local paths participate in a deployment.
//!
//! Two ordered pattern lists drive the decision. The ignore list defaults
//! to accept and its patterns add exclusions; a non-empty include list
//! flips the default to reject and its patterns add inclusions. Within a
//! list the last matching pattern wins, and a `!` prefix inverts the
//! pattern's decision (re-including a previously excluded path).
//!
//! Verdicts inherit downward: a path with no matching pattern takes its
//! parent directory's verdict, so excluding a directory excludes its
//! subtree while a later `!` pattern can still rescue one descendant.
//!
//! Pattern tokens: `/foo` anchored at the root, `foo` floating (matches
//! in any directory), `foo/` directories only, `*` any run of non-`/`
//! characters, `**` any run including `/`, `?` one non-`/` character,
//! `[abc]` a character class.

mod glob;

use berth_core::error::{DeployError, DeployResult};
use glob::glob_match;

#[derive(Debug, Clone)]
struct Rule {
    raw: String,
    /// `!` prefix: this rule re-includes instead of selecting.
    negated: bool,
    /// Trailing `/`: matches directories only.
    dir_only: bool,
    /// Leading `/`: matched against the whole path from the root.
    anchored: bool,
    /// Pattern body with the prefix/suffix markers stripped.
    body: Vec<char>,
}

impl Rule {
    fn compile(raw: &str) -> DeployResult<Rule> {
        let mut rest = raw.trim();
        let negated = if let Some(r) = rest.strip_prefix('!') {
            rest = r;
            true
        } else {
            false
        };
        let dir_only = if let Some(r) = rest.strip_suffix('/') {
            rest = r;
            true
        } else {
            false
        };
        let anchored = if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            true
        } else {
            false
        };
        if rest.is_empty() {
            return Err(DeployError::Filter {
                pattern: raw.to_string(),
                detail: "empty pattern".to_string(),
            });
        }
        glob::validate(rest).map_err(|detail| DeployError::Filter {
            pattern: raw.to_string(),
            detail,
        })?;
        Ok(Rule {
            raw: raw.to_string(),
            negated,
            dir_only,
            anchored,
            body: rest.chars().collect(),
        })
    }

    /// Match against a `/`-rooted path with the leading slash stripped.
    fn matches(&self, stripped: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        let text: Vec<char> = stripped.chars().collect();
        if self.anchored {
            return glob_match(&self.body, &text);
        }
        // Floating patterns may start at any component boundary.
        let mut start = 0;
        loop {
            if glob_match(&self.body, &text[start..]) {
                return true;
            }
            match text[start..].iter().position(|&c| c == '/') {
                Some(i) => start += i + 1,
                None => return false,
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    fn compile(patterns: &[String]) -> DeployResult<RuleList> {
        let rules = patterns
            .iter()
            .map(|p| Rule::compile(p))
            .collect::<DeployResult<Vec<_>>>()?;
        Ok(RuleList { rules })
    }

    fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn has_negations(&self) -> bool {
        self.rules.iter().any(|r| r.negated)
    }

    /// Last-matching-rule verdict for a single path, `None` when no rule
    /// matches. `Some(true)` means selected by the list, `Some(false)`
    /// means a negated rule fired.
    fn decide(&self, rel: &str, is_dir: bool) -> Option<bool> {
        let stripped = rel.strip_prefix('/').unwrap_or(rel);
        let mut verdict = None;
        for rule in &self.rules {
            if rule.matches(stripped, is_dir) {
                verdict = Some(!rule.negated);
            }
        }
        verdict
    }

    /// Verdict for a path including inheritance from its ancestors:
    /// each ancestor directory is decided root-down and an unmatched
    /// level keeps the verdict of the level above.
    fn inherited(&self, rel: &str, is_dir: bool) -> Option<bool> {
        let mut verdict = None;
        let bytes = rel.as_bytes();
        for i in 1..bytes.len() {
            if bytes[i] == b'/' {
                if let Some(v) = self.decide(&rel[..i], true) {
                    verdict = Some(v);
                }
            }
        }
        if let Some(v) = self.decide(rel, is_dir) {
            verdict = Some(v);
        }
        verdict
    }
}

/// Compiled include/ignore filter for one site.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: RuleList,
    ignore: RuleList,
}

impl PathFilter {
    pub fn new(include_patterns: &[String], ignore_patterns: &[String]) -> DeployResult<Self> {
        Ok(PathFilter {
            include: RuleList::compile(include_patterns)?,
            ignore: RuleList::compile(ignore_patterns)?,
        })
    }

    /// Whether `rel` (a `/`-rooted POSIX path) participates in the run.
    pub fn accepts(&self, rel: &str, is_dir: bool) -> bool {
        let included = if self.include.is_empty() {
            true
        } else {
            self.include.inherited(rel, is_dir).unwrap_or(false)
        };
        let ignored = self.ignore.inherited(rel, is_dir).unwrap_or(false);
        included && !ignored
    }

    /// Whether the scanner may skip descending into `rel` entirely.
    ///
    /// Only safe when the directory is ignore-rejected and no `!` pattern
    /// exists that could rescue a descendant. The include list never
    /// prunes: the scanner over-descends so that deep includable files
    /// are found under unmatched directories.
    pub fn prune_dir(&self, rel: &str) -> bool {
        if self.ignore.has_negations() {
            return false;
        }
        self.ignore.inherited(rel, true).unwrap_or(false)
    }
}

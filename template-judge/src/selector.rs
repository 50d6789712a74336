//! Control selection
//!
//! Among the templates that matched a request, pick the single one whose
//! requirements can be satisfied by files that are present (locally or
//! remotely) or declared creatable, preferring the one that uses the most
//! files. Ties are an error: nothing is silently preferred.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::template::{Bindings, Template, TemplateBody};

/// Filename -> containing directory lookup, split by locality
#[derive(Debug, Clone, Default)]
pub struct FileCaches {
    pub local: HashMap<String, PathBuf>,
    pub remote: HashMap<String, PathBuf>,
}

impl FileCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.local.insert(name.into(), dir.into());
        self
    }

    pub fn with_remote(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.remote.insert(name.into(), dir.into());
        self
    }
}

/// How a single requirement is satisfied
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    FoundLocal(PathBuf),
    FoundRemote(PathBuf),
    Creatable,
    Missing,
}

/// A matched template with its wildcard-substituted body
#[derive(Debug, Clone)]
pub struct Candidate {
    pub template: Arc<Template>,
    pub bindings: Bindings,
    pub body: TemplateBody,
}

/// A file the chosen template reads, with the directory it was found in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedFile {
    pub name: String,
    pub dir: PathBuf,
}

/// The chosen template plus its resolved file plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Control {
    pub template: String,
    pub body: TemplateBody,
    pub local_required: Vec<LocatedFile>,
    pub remote_required: Vec<LocatedFile>,
    pub creatable: Vec<String>,
}

#[derive(Debug)]
struct Evaluation {
    name: String,
    requirements: Vec<String>,
    local: Vec<LocatedFile>,
    remote: Vec<LocatedFile>,
    creatable: Vec<String>,
    missing: Vec<String>,
}

impl Evaluation {
    fn score(&self) -> usize {
        self.local.len() + self.remote.len() + self.creatable.len()
    }

    fn feasible(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Clone, Copy)]
enum Locality {
    Any,
    Local,
    Remote,
}

fn resolve(name: &str, locality: Locality, caches: &FileCaches, creatable: &BTreeSet<&str>) -> Resolution {
    let local = || caches.local.get(name).cloned().map(Resolution::FoundLocal);
    let remote = || caches.remote.get(name).cloned().map(Resolution::FoundRemote);
    let found = match locality {
        Locality::Any => local().or_else(remote),
        Locality::Local => local(),
        Locality::Remote => remote(),
    };
    match found {
        Some(r) => r,
        None if creatable.contains(name) => Resolution::Creatable,
        None => Resolution::Missing,
    }
}

fn evaluate(candidate: &Candidate, caches: &FileCaches) -> Evaluation {
    let body = &candidate.body;
    let creatable: BTreeSet<&str> = body.creatable.iter().map(|s| s.as_str()).collect();
    let mut eval = Evaluation {
        name: candidate.template.name.clone(),
        requirements: Vec::new(),
        local: Vec::new(),
        remote: Vec::new(),
        creatable: Vec::new(),
        missing: Vec::new(),
    };

    let mut seen = BTreeSet::new();
    let declared = body
        .requires
        .iter()
        .map(|n| (n, Locality::Any))
        .chain(body.local_requires.iter().map(|n| (n, Locality::Local)))
        .chain(body.remote_requires.iter().map(|n| (n, Locality::Remote)));

    for (name, locality) in declared {
        if !seen.insert(name.as_str()) {
            continue;
        }
        eval.requirements.push(name.clone());
        match resolve(name, locality, caches, &creatable) {
            Resolution::FoundLocal(dir) => eval.local.push(LocatedFile { name: name.clone(), dir }),
            Resolution::FoundRemote(dir) => eval.remote.push(LocatedFile { name: name.clone(), dir }),
            Resolution::Creatable => eval.creatable.push(name.clone()),
            Resolution::Missing => eval.missing.push(name.clone()),
        }
    }
    eval
}

/// Choose the unique best feasible candidate
pub fn select_control(candidates: Vec<Candidate>, caches: &FileCaches, request: &str) -> Result<Control> {
    if candidates.is_empty() {
        return Err(EngineError::Config(format!("no template matches {}", request)));
    }

    let evaluations: Vec<Evaluation> = candidates.iter().map(|c| evaluate(c, caches)).collect();
    for eval in &evaluations {
        debug!(
            "Template {}: score={} missing={:?}",
            eval.name,
            eval.score(),
            eval.missing
        );
    }

    let best = evaluations
        .iter()
        .filter(|e| e.feasible())
        .map(|e| e.score())
        .max();

    let Some(best) = best else {
        if let [only] = evaluations.as_slice() {
            return Err(EngineError::Requirement(format!(
                "{}: required files missing for template {}: {}",
                request,
                only.name,
                only.missing.join(", ")
            )));
        }
        let fewest = evaluations.iter().map(|e| e.missing.len()).min().unwrap_or(0);
        let closest: Vec<String> = evaluations
            .iter()
            .filter(|e| e.missing.len() == fewest)
            .map(|e| format!("{} (missing {})", e.name, e.missing.join(", ")))
            .collect();
        return Err(EngineError::Config(format!(
            "no feasible template for {}; closest: {}",
            request,
            closest.join("; ")
        )));
    };

    let mut winners: Vec<usize> = evaluations
        .iter()
        .enumerate()
        .filter(|(_, e)| e.feasible() && e.score() == best)
        .map(|(i, _)| i)
        .collect();

    if winners.len() > 1 {
        let tied: Vec<String> = winners
            .iter()
            .map(|&i| {
                let e = &evaluations[i];
                format!("{} requires [{}]", e.name, e.requirements.join(", "))
            })
            .collect();
        return Err(EngineError::Config(format!(
            "ambiguous templates for {}: {}",
            request,
            tied.join("; ")
        )));
    }

    let idx = winners.remove(0);
    let eval = &evaluations[idx];
    let candidate = &candidates[idx];
    info!("Selected template {} for {}", eval.name, request);

    Ok(Control {
        template: candidate.template.name.clone(),
        body: candidate.body.clone(),
        local_required: eval.local.clone(),
        remote_required: eval.remote.clone(),
        creatable: eval.creatable.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;

    fn candidate(name: &str, body: &str) -> Candidate {
        let template = Arc::new(Template::parse(name, &format!("template/{}.tmpl", name), body).unwrap());
        let body = template.substitute(&Bindings::new()).unwrap();
        Candidate {
            template,
            bindings: Bindings::new(),
            body,
        }
    }

    #[test]
    fn test_selects_only_feasible() {
        let caches = FileCaches::new().with_local("header.h", "/p");
        let a = candidate("a.cc:a:", r#"{"REQUIRES": ["header.h"]}"#);
        let b = candidate("a.cc:a:X", r#"{"REQUIRES": ["other.h"]}"#);

        let control = select_control(vec![a, b], &caches, "a.cc -> a").unwrap();
        assert_eq!(control.template, "a.cc:a:");
        assert_eq!(control.local_required[0].name, "header.h");
        assert_eq!(control.local_required[0].dir, PathBuf::from("/p"));
    }

    #[test]
    fn test_higher_score_wins() {
        let caches = FileCaches::new()
            .with_local("x.h", "/p")
            .with_remote("lib.h", "/lib");
        let a = candidate("a:b:", r#"{"REQUIRES": ["x.h"]}"#);
        let b = candidate("a:b:Y", r#"{"REQUIRES": ["x.h", "lib.h"]}"#);

        let control = select_control(vec![a, b], &caches, "a -> b").unwrap();
        assert_eq!(control.template, "a:b:Y");
        assert_eq!(control.remote_required[0].name, "lib.h");
    }

    #[test]
    fn test_tie_is_ambiguous() {
        let caches = FileCaches::new().with_local("x.h", "/p").with_local("y.h", "/p");
        let a = candidate("a:b:", r#"{"REQUIRES": ["x.h"]}"#);
        let b = candidate("a:b:Y", r#"{"REQUIRES": ["y.h"]}"#);

        let err = select_control(vec![a, b], &caches, "a -> b").unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(msg.contains("ambiguous"));
        assert!(msg.contains("a:b: requires [x.h]"));
        assert!(msg.contains("a:b:Y requires [y.h]"));
    }

    #[test]
    fn test_locality_is_enforced() {
        let caches = FileCaches::new().with_remote("x.h", "/lib");
        let a = candidate("a:b:", r#"{"LOCAL-REQUIRES": ["x.h"]}"#);

        let err = select_control(vec![a], &caches, "a -> b").unwrap_err();
        assert!(matches!(err, EngineError::Requirement(_)));
        assert!(err.to_string().contains("x.h"));
    }

    #[test]
    fn test_creatable_counts() {
        let caches = FileCaches::new();
        let a = candidate("a:b:", r#"{"REQUIRES": ["gen.in"], "CREATABLE": ["gen.in"]}"#);

        let control = select_control(vec![a], &caches, "a -> b").unwrap();
        assert_eq!(control.creatable, vec!["gen.in"]);
    }

    #[test]
    fn test_no_feasible_lists_closest() {
        let caches = FileCaches::new();
        let a = candidate("a:b:", r#"{"REQUIRES": ["x", "y"]}"#);
        let b = candidate("a:b:Y", r#"{"REQUIRES": ["z"]}"#);

        let err = select_control(vec![a, b], &caches, "a -> b").unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(msg.contains("a:b:Y (missing z)"));
        assert!(!msg.contains("a:b: (missing"));
    }

    #[test]
    fn test_no_candidates() {
        let err = select_control(vec![], &FileCaches::new(), "a -> b").unwrap_err();
        assert!(err.to_string().contains("no template matches"));
    }
}

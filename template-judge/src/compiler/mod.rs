//! Compiler module - turns template commands into a shell script
//!
//! The generated script reports its progress on stdout:
//! - first line `<pid> PID`
//! - last line `::<n> <exitcode> DONE`, where `n` is the number of the
//!   command line that was running when the script exited
//!
//! Compilation is pure: the same lines and substitutions always give the
//! same script.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Line number -> status file written by the command on that line
pub type RunMap = BTreeMap<u32, String>;

/// Compiled script plus its status file map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunScript {
    pub text: String,
    pub run_map: RunMap,
    /// Number of command lines (highest `n`)
    pub lines: u32,
}

const PROLOGUE: &str = "trap 'c=$?; echo \"::${n:-0} $c DONE\"' EXIT\necho \"$$ PID\"\nset -e\n";

fn status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)-status\s+(\S+)").expect("static regex"))
}

/// Replace substitution keys, longest key first, in a single pass
pub fn apply_substitutions(line: &str, substitutions: &BTreeMap<String, String>) -> String {
    if substitutions.is_empty() {
        return line.to_string();
    }
    let mut keys: Vec<&String> = substitutions.keys().filter(|k| !k.is_empty()).collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let alternation = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    let Ok(re) = Regex::new(&alternation) else {
        return line.to_string();
    };
    re.replace_all(line, |caps: &regex::Captures<'_>| {
        substitutions.get(&caps[0]).cloned().unwrap_or_default()
    })
    .into_owned()
}

/// Whether a line ends in a backslash that is not itself escaped
fn continues(line: &str) -> bool {
    let trailing = line.bytes().rev().take_while(|&b| b == b'\\').count();
    trailing % 2 == 1
}

/// Compile command lines into a script
pub fn compile(commands: &[String], substitutions: &BTreeMap<String, String>) -> RunScript {
    let mut text = String::from(PROLOGUE);
    let mut run_map = RunMap::new();
    let mut n = 0u32;
    let mut continuation = false;

    let physical = commands.iter().flat_map(|c| c.split('\n'));
    for raw in physical {
        let line = apply_substitutions(raw, substitutions);

        if continuation {
            text.push_str(&line);
        } else {
            n += 1;
            text.push_str(&format!("n={};{}", n, line));
        }
        text.push('\n');

        if let Some(caps) = status_re().captures(&line) {
            run_map.entry(n).or_insert_with(|| caps[1].to_string());
        }
        continuation = continues(&line);
    }

    RunScript {
        text,
        run_map,
        lines: n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prologue_order() {
        let script = compile(&[], &BTreeMap::new());
        let mut it = script.text.lines();
        assert!(it.next().unwrap().starts_with("trap "));
        assert_eq!(it.next().unwrap(), "echo \"$$ PID\"");
        assert_eq!(it.next().unwrap(), "set -e");
        assert_eq!(script.lines, 0);
    }

    #[test]
    fn test_plain_lines_numbered() {
        let script = compile(&lines(&["a", "b", "c"]), &BTreeMap::new());
        let body: Vec<&str> = script.text.lines().skip(3).collect();
        assert_eq!(body, vec!["n=1;a", "n=2;b", "n=3;c"]);
        assert_eq!(script.lines, 3);
    }

    #[test]
    fn test_continuation_shares_number() {
        let script = compile(&lines(&["g++ \\", "  -o x x.cc", "./x"]), &BTreeMap::new());
        let body: Vec<&str> = script.text.lines().skip(3).collect();
        assert_eq!(body, vec!["n=1;g++ \\", "  -o x x.cc", "n=2;./x"]);
    }

    #[test]
    fn test_escaped_backslash_is_not_continuation() {
        let script = compile(&lines(&["echo a\\\\", "b"]), &BTreeMap::new());
        let body: Vec<&str> = script.text.lines().skip(3).collect();
        assert_eq!(body, vec!["n=1;echo a\\\\", "n=2;b"]);
    }

    #[test]
    fn test_status_files_mapped() {
        let script = compile(
            &lines(&["make", "sandbox -status x.stat \\", "  ./x", "sandbox -status y.stat ./y"]),
            &BTreeMap::new(),
        );
        assert_eq!(script.run_map.get(&2).map(String::as_str), Some("x.stat"));
        assert_eq!(script.run_map.get(&3).map(String::as_str), Some("y.stat"));
        assert!(!script.run_map.contains_key(&1));
        let descending: Vec<u32> = script.run_map.keys().rev().copied().collect();
        assert_eq!(descending, vec![3, 2]);
    }

    #[test]
    fn test_substitutions_applied_first() {
        let mut subs = BTreeMap::new();
        subs.insert("FLAGS".to_string(), "-O2".to_string());
        subs.insert("FLAGSX".to_string(), "-g".to_string());
        subs.insert("STAT".to_string(), "-status s.stat".to_string());

        let script = compile(&lines(&["cc FLAGS FLAGSX STAT"]), &subs);
        assert!(script.text.contains("n=1;cc -O2 -g -status s.stat\n"));
        assert_eq!(script.run_map.get(&1).map(String::as_str), Some("s.stat"));
    }

    #[test]
    fn test_deterministic() {
        let cmds = lines(&["a", "b \\", "c"]);
        assert_eq!(compile(&cmds, &BTreeMap::new()), compile(&cmds, &BTreeMap::new()));
    }
}

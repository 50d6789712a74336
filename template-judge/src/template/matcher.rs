//! Wildcard matching of (source, destination) names against template names
//!
//! A wildcard is an exact run of 4 identical uppercase letters (`XXXX`,
//! `BBBB`). `PPPP` always stands for the problem name. Runs of 3 or 5 equal
//! letters are plain text. A symbol used twice compiles to a backreference,
//! so the match backtracks until every occurrence binds the same text.

use std::collections::BTreeMap;

use fancy_regex::Regex;
use tracing::debug;

/// Wildcard symbol -> matched substring
pub type Bindings = BTreeMap<String, String>;

/// Symbol always bound to the problem name
pub const PROBLEM_SYMBOL: &str = "PPPP";

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Symbol(&'a str),
}

/// Split text into literal runs and exact 4-letter wildcard symbols
fn segments(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let mut j = i + 1;
        while j < bytes.len() && bytes[j] == c {
            j += 1;
        }
        if c.is_ascii_uppercase() && j - i == 4 {
            if literal_start < i {
                out.push(Segment::Literal(&text[literal_start..i]));
            }
            out.push(Segment::Symbol(&text[i..j]));
            literal_start = j;
        }
        i = j;
    }
    if literal_start < bytes.len() {
        out.push(Segment::Literal(&text[literal_start..]));
    }
    out
}

/// Replace every bound wildcard symbol in `text`
pub fn substitute_str(text: &str, bindings: &Bindings) -> String {
    let mut out = String::with_capacity(text.len());
    for segment in segments(text) {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Symbol(sym) => match bindings.get(sym) {
                Some(value) => out.push_str(value),
                None => out.push_str(sym),
            },
        }
    }
    out
}

/// A compiled `SRC:DES` pattern for one problem
#[derive(Debug, Clone)]
pub struct TemplatePattern {
    regex: Regex,
    /// Symbol captured by each group, in group order
    symbols: Vec<String>,
    problem: String,
}

impl TemplatePattern {
    /// Compile a pattern, substituting `problem` for `PPPP`
    pub fn new(pattern: &str, problem: &str) -> Result<Self, fancy_regex::Error> {
        let mut re = String::from("^");
        let mut symbols: Vec<String> = Vec::new();

        for segment in segments(pattern) {
            match segment {
                Segment::Literal(s) => re.push_str(&fancy_regex::escape(s)),
                Segment::Symbol(sym) if sym == PROBLEM_SYMBOL => re.push_str(&fancy_regex::escape(problem)),
                Segment::Symbol(sym) => match symbols.iter().position(|s| s == sym) {
                    Some(idx) => re.push_str(&format!("\\{}", idx + 1)),
                    None => {
                        re.push_str("([^:/]+)");
                        symbols.push(sym.to_string());
                    }
                },
            }
        }
        re.push('$');

        Ok(Self {
            regex: Regex::new(&re)?,
            symbols,
            problem: problem.to_string(),
        })
    }

    /// Match `names`, returning wildcard bindings (including `PPPP`)
    pub fn matches(&self, names: &str) -> Option<Bindings> {
        let caps = match self.regex.captures(names) {
            Ok(caps) => caps?,
            Err(e) => {
                debug!("Pattern match on {:?} aborted: {}", names, e);
                return None;
            }
        };
        let mut bindings = Bindings::new();
        bindings.insert(PROBLEM_SYMBOL.to_string(), self.problem.clone());
        for (idx, symbol) in self.symbols.iter().enumerate() {
            bindings.insert(symbol.clone(), caps.get(idx + 1)?.as_str().to_string());
        }
        Some(bindings)
    }
}

/// Match `names` against `pattern` in one step
pub fn match_pattern(names: &str, pattern: &str, problem: &str) -> Option<Bindings> {
    TemplatePattern::new(pattern, problem).ok()?.matches(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_symbols_bind() {
        let b = match_pattern("foo-bar", "XXXX-BBBB", "prob").unwrap();
        assert_eq!(b["XXXX"], "foo");
        assert_eq!(b["BBBB"], "bar");
        assert_eq!(b["PPPP"], "prob");
    }

    #[test]
    fn test_repeated_symbol_must_agree() {
        let b = match_pattern("foo-foo", "XXXX-XXXX", "prob").unwrap();
        assert_eq!(b["XXXX"], "foo");
        assert!(match_pattern("foo-bar", "XXXX-XXXX", "prob").is_none());
    }

    #[test]
    fn test_repeated_symbol_backtracks() {
        let b = match_pattern("a-a-a-a", "XXXX-XXXX", "p").unwrap();
        assert_eq!(b["XXXX"], "a-a");
        let b = match_pattern("x.c:x.c.o", "XXXX:XXXX.o", "p").unwrap();
        assert_eq!(b["XXXX"], "x.c");
        assert!(match_pattern("a-a-a", "XXXX-XXXX", "p").is_none());
    }

    #[test]
    fn test_three_and_five_letter_runs_are_literal() {
        assert!(match_pattern("XXX-a", "XXX-AAAA", "p").is_some());
        assert!(match_pattern("foo-a", "XXX-AAAA", "p").is_none());
        assert!(match_pattern("XXXXX.c", "XXXXX.c", "p").is_some());
        assert!(match_pattern("abc.c", "XXXXX.c", "p").is_none());
    }

    #[test]
    fn test_dot_is_literal() {
        assert!(match_pattern("sol.cc:sol", "XXXX.cc:XXXX", "p").is_some());
        assert!(match_pattern("solxcc:sol", "XXXX.cc:XXXX", "p").is_none());
    }

    #[test]
    fn test_problem_symbol() {
        assert!(match_pattern("hello.in:hello.out", "PPPP.in:PPPP.out", "hello").is_some());
        assert!(match_pattern("other.in:other.out", "PPPP.in:PPPP.out", "hello").is_none());
    }

    #[test]
    fn test_wildcard_does_not_cross_separator() {
        assert!(match_pattern("a:b:c", "XXXX:YYYY", "p").is_none());
    }

    #[test]
    fn test_substitute_only_exact_runs() {
        let mut b = Bindings::new();
        b.insert("XXXX".into(), "sol".into());
        assert_eq!(substitute_str("XXXX.cc XXXXX YYYY", &b), "sol.cc XXXXX YYYY");
    }
}

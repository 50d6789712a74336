//! Option resolution
//!
//! Option schemas are merged across data roots (lowest priority first, so the
//! highest-priority root writes last), then per-problem overrides are
//! validated against the merged schema and projected into the substitution
//! map used by the command compiler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Diagnostics, EngineError, Result};
use crate::storage::Storage;
use crate::template::catalog::TEMPLATE_DIR;

/// Schema file name inside each root's template directory
pub const SCHEMA_FILE: &str = "template.options";

/// Raw schema entry as written in an options file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOptionEntry {
    #[serde(default)]
    pub values: Option<Vec<Value>>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub range: Option<[f64; 2]>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub argname: Option<String>,
    #[serde(default)]
    pub valname: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub type RawSchema = BTreeMap<String, RawOptionEntry>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericKind {
    Natural,
    Float,
}

/// Value domain of an option
#[derive(Debug, Clone, PartialEq)]
pub enum OptionDomain {
    Enumerated {
        values: Vec<String>,
        default: Option<String>,
    },
    Numeric {
        kind: NumericKind,
        range: Option<(f64, f64)>,
        default: Option<String>,
    },
    FreeArgs {
        default: Option<String>,
    },
}

/// Where a resolved value goes in the substitution map
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    ArgName(String),
    ValName(String),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionSpec {
    pub name: String,
    pub domain: OptionDomain,
    pub target: Projection,
}

fn natural_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+$").expect("static regex"))
}

fn args_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.,:=+/\- ]*$").expect("static regex"))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn format_number(kind: NumericKind, value: f64) -> String {
    match kind {
        NumericKind::Natural => format!("{}", value.round() as i64),
        NumericKind::Float => format!("{}", value),
    }
}

impl OptionSpec {
    /// Build a typed spec from a raw schema entry
    pub fn from_raw(name: &str, raw: &RawOptionEntry) -> std::result::Result<Self, String> {
        let default = match &raw.default {
            Some(v) => Some(scalar(v).ok_or_else(|| format!("option {}: default must be a scalar", name))?),
            None => None,
        };

        let domain = match (&raw.values, raw.kind.as_deref()) {
            (Some(_), Some(_)) => {
                return Err(format!("option {}: has both values and type", name));
            }
            (Some(values), None) => {
                let values = values
                    .iter()
                    .map(|v| scalar(v).ok_or_else(|| format!("option {}: values must be scalars", name)))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                OptionDomain::Enumerated { values, default }
            }
            (None, Some(kind @ ("natural" | "float"))) => {
                let kind = if kind == "natural" {
                    NumericKind::Natural
                } else {
                    NumericKind::Float
                };
                let range = match raw.range {
                    Some([lo, hi]) if lo > hi => {
                        return Err(format!("option {}: range lower bound exceeds upper bound", name));
                    }
                    Some([lo, hi]) => Some((lo, hi)),
                    None => None,
                };
                OptionDomain::Numeric { kind, range, default }
            }
            (None, Some("args")) => OptionDomain::FreeArgs { default },
            (None, Some(other)) => {
                return Err(format!("option {}: unknown type {:?}", name, other));
            }
            (None, None) => {
                return Err(format!("option {}: needs either values or type", name));
            }
        };

        let target = match (&raw.argname, &raw.valname) {
            (Some(_), Some(_)) => {
                return Err(format!("option {}: has both argname and valname", name));
            }
            (Some(arg), None) => Projection::ArgName(arg.clone()),
            (None, Some(val)) => Projection::ValName(val.clone()),
            (None, None) => Projection::None,
        };

        Ok(Self {
            name: name.to_string(),
            domain,
            target,
        })
    }

    /// Validate an override (or its absence) into a concrete value.
    ///
    /// Bad overrides produce warnings and fall back; an option left with no
    /// usable value produces an error and resolves to `None`.
    pub fn validate(&self, raw: Option<&str>) -> (Option<String>, Diagnostics) {
        let mut diag = Diagnostics::new();
        let name = &self.name;

        let value = match &self.domain {
            OptionDomain::Enumerated { values, default } => {
                let fallback = default.clone().or_else(|| values.first().cloned());
                match raw {
                    Some(v) if values.iter().any(|x| x == v) => Some(v.to_string()),
                    Some(v) => {
                        diag.warn(format!(
                            "option {}: {:?} is not one of [{}]; using default",
                            name,
                            v,
                            values.join(", ")
                        ));
                        fallback
                    }
                    None => fallback,
                }
            }
            OptionDomain::Numeric { kind, range, default } => {
                let accepted = raw.and_then(|v| self.check_numeric(*kind, *range, v.trim(), &mut diag));
                accepted
                    .or_else(|| default.clone())
                    .or_else(|| range.map(|(_, hi)| format_number(*kind, hi)))
            }
            OptionDomain::FreeArgs { default } => match raw {
                Some(v) if args_re().is_match(v) => Some(v.to_string()),
                Some(v) => {
                    diag.warn(format!(
                        "option {}: {:?} contains characters not allowed in arguments; using default",
                        name, v
                    ));
                    Some(default.clone().unwrap_or_default())
                }
                None => Some(default.clone().unwrap_or_default()),
            },
        };

        if value.is_none() {
            diag.error(format!("option {}: no valid value and no default; option dropped", name));
        }
        (value, diag)
    }

    fn check_numeric(
        &self,
        kind: NumericKind,
        range: Option<(f64, f64)>,
        raw: &str,
        diag: &mut Diagnostics,
    ) -> Option<String> {
        let name = &self.name;
        let number = match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => n,
            _ => {
                diag.warn(format!("option {}: {:?} is not a number; using default", name, raw));
                return None;
            }
        };
        if kind == NumericKind::Natural && !natural_re().is_match(raw) {
            diag.warn(format!("option {}: {:?} is not a natural number; using default", name, raw));
            return None;
        }
        if let Some((lo, hi)) = range {
            if number < lo {
                let clamped = format_number(kind, lo);
                diag.warn(format!("option {}: {} is below minimum {}; using {}", name, raw, clamped, clamped));
                return Some(clamped);
            }
            if number > hi {
                let clamped = format_number(kind, hi);
                diag.warn(format!("option {}: {} is above maximum {}; using {}", name, raw, clamped, clamped));
                return Some(clamped);
            }
        }
        Some(raw.to_string())
    }
}

/// Merge schema layers at per-option granularity; later layers win
pub fn merge_layers(layers: impl IntoIterator<Item = RawSchema>) -> RawSchema {
    let mut merged = RawSchema::new();
    for layer in layers {
        merged.extend(layer);
    }
    merged
}

/// Typed, merged option schema
#[derive(Debug, Clone, Default)]
pub struct OptionSchema {
    specs: BTreeMap<String, OptionSpec>,
}

impl OptionSchema {
    pub fn from_raw(raw: &RawSchema) -> Result<Self> {
        let specs = raw
            .iter()
            .map(|(name, entry)| {
                OptionSpec::from_raw(name, entry).map(|spec| (name.clone(), spec))
            })
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map_err(EngineError::Config)?;
        Ok(Self { specs })
    }

    /// Load and merge `<root>/template/template.options` across roots.
    ///
    /// `roots` is in priority order, so it is merged back to front.
    pub async fn load(storage: &dyn Storage, roots: &[PathBuf]) -> Result<Self> {
        let mut layers = Vec::new();
        for root in roots.iter().rev() {
            let rel = format!("{}/{}", TEMPLATE_DIR, SCHEMA_FILE);
            if let Some(layer) = read_json::<RawSchema>(storage, &root.join(&rel), &rel).await? {
                layers.push(layer);
            }
        }
        let schema = Self::from_raw(&merge_layers(layers))?;
        debug!("Option schema has {} options", schema.specs.len());
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.get(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Resolve overrides into the substitution map
    pub fn resolve(&self, overrides: &BTreeMap<String, String>) -> (BTreeMap<String, String>, Diagnostics) {
        let mut diag = Diagnostics::new();

        for name in overrides.keys() {
            if !self.specs.contains_key(name) {
                diag.warn(format!("option {}: unknown option ignored", name));
            }
        }

        let mut args: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut vals: BTreeMap<String, String> = BTreeMap::new();

        for (name, spec) in &self.specs {
            let (value, d) = spec.validate(overrides.get(name).map(|s| s.as_str()));
            diag.extend(d);
            match &spec.target {
                Projection::ArgName(arg) => {
                    let bucket = args.entry(arg.clone()).or_default();
                    if let Some(v) = value.filter(|v| !v.is_empty()) {
                        bucket.push(v);
                    }
                }
                Projection::ValName(val) => {
                    if let Some(v) = value {
                        vals.insert(val.clone(), v);
                    }
                }
                Projection::None => {}
            }
        }

        let mut substitutions: BTreeMap<String, String> =
            args.into_iter().map(|(k, v)| (k, v.join(" "))).collect();
        substitutions.extend(vals);

        for w in &diag.warnings {
            warn!("{}", w);
        }
        (substitutions, diag)
    }
}

/// Read a flat `name -> value` override file
pub async fn load_overrides(storage: &dyn Storage, path: &Path, rel: &str) -> Result<BTreeMap<String, String>> {
    let Some(raw) = read_json::<BTreeMap<String, Value>>(storage, path, rel).await? else {
        return Ok(BTreeMap::new());
    };
    raw.into_iter()
        .map(|(k, v)| {
            scalar(&v)
                .map(|s| (k.clone(), s))
                .ok_or_else(|| EngineError::Config(format!("{}: option {} must be a scalar", rel, k)))
        })
        .collect()
}

async fn read_json<T: serde::de::DeserializeOwned>(storage: &dyn Storage, path: &Path, rel: &str) -> Result<Option<T>> {
    let text = match storage.read_string(path).await {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(None),
        Err(_) => return Err(EngineError::Config(format!("{}: cannot read options file", rel))),
    };
    let cleaned = crate::template::strip_dialect(&text);
    serde_json::from_str(&cleaned)
        .map(Some)
        .map_err(|e| EngineError::Config(format!("{}: cannot parse options: {}", rel, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn numeric(range: Option<(f64, f64)>, default: Option<&str>) -> OptionSpec {
        OptionSpec {
            name: "time".into(),
            domain: OptionDomain::Numeric {
                kind: NumericKind::Natural,
                range,
                default: default.map(String::from),
            },
            target: Projection::ValName("TIME".into()),
        }
    }

    #[test]
    fn test_numeric_clamp_and_fallback() {
        let spec = numeric(Some((1.0, 10.0)), Some("5"));

        let (v, d) = spec.validate(Some("20"));
        assert_eq!(v.as_deref(), Some("10"));
        assert_eq!(d.warnings.len(), 1);

        let (v, d) = spec.validate(Some("abc"));
        assert_eq!(v.as_deref(), Some("5"));
        assert_eq!(d.warnings.len(), 1);

        let (v, d) = spec.validate(Some("7"));
        assert_eq!(v.as_deref(), Some("7"));
        assert!(d.warnings.is_empty());

        let (v, d) = spec.validate(Some("0"));
        assert_eq!(v.as_deref(), Some("1"));
        assert_eq!(d.warnings.len(), 1);
    }

    #[test]
    fn test_natural_rejects_fraction() {
        let spec = numeric(Some((1.0, 10.0)), Some("5"));
        let (v, d) = spec.validate(Some("2.5"));
        assert_eq!(v.as_deref(), Some("5"));
        assert!(d.warnings[0].contains("natural"));
    }

    #[test]
    fn test_no_default_falls_back_to_upper_bound() {
        let spec = numeric(Some((1.0, 10.0)), None);
        let (v, d) = spec.validate(None);
        assert_eq!(v.as_deref(), Some("10"));
        assert!(d.errors.is_empty());
    }

    #[test]
    fn test_no_default_no_range_is_error() {
        let spec = numeric(None, None);
        let (v, d) = spec.validate(Some("x"));
        assert_eq!(v, None);
        assert_eq!(d.warnings.len(), 1);
        assert_eq!(d.errors.len(), 1);
    }

    #[test]
    fn test_enumerated() {
        let spec = OptionSpec {
            name: "std".into(),
            domain: OptionDomain::Enumerated {
                values: vec!["-std=c++17".into(), "-std=c++20".into()],
                default: None,
            },
            target: Projection::ArgName("CXXFLAGS".into()),
        };
        assert_eq!(spec.validate(Some("-std=c++20")).0.as_deref(), Some("-std=c++20"));
        let (v, d) = spec.validate(Some("-std=c++98"));
        assert_eq!(v.as_deref(), Some("-std=c++17"));
        assert_eq!(d.warnings.len(), 1);
    }

    #[test]
    fn test_free_args_charset() {
        let spec = OptionSpec {
            name: "extra".into(),
            domain: OptionDomain::FreeArgs { default: Some("-O2".into()) },
            target: Projection::ArgName("CXXFLAGS".into()),
        };
        assert_eq!(spec.validate(Some("-O3 -DX=1")).0.as_deref(), Some("-O3 -DX=1"));
        let (v, d) = spec.validate(Some("-O3; rm -rf /"));
        assert_eq!(v.as_deref(), Some("-O2"));
        assert_eq!(d.warnings.len(), 1);
    }

    #[test]
    fn test_from_raw_rejects_mixed_domain() {
        let raw: RawOptionEntry =
            serde_json::from_str(r#"{"values": ["a"], "type": "natural"}"#).unwrap();
        assert!(OptionSpec::from_raw("x", &raw).is_err());
    }

    #[test]
    fn test_merge_last_writer_wins_per_option() {
        let home: RawSchema = serde_json::from_str(
            r#"{"a": {"values": ["1", "2"]}, "b": {"type": "natural", "default": 3}}"#,
        )
        .unwrap();
        let site: RawSchema = serde_json::from_str(r#"{"a": {"values": ["9"]}}"#).unwrap();
        let merged = merge_layers([home, site]);
        let schema = OptionSchema::from_raw(&merged).unwrap();

        assert_eq!(
            schema.get("a").unwrap().domain,
            OptionDomain::Enumerated { values: vec!["9".into()], default: None }
        );
        assert!(schema.get("b").is_some());
    }

    #[test]
    fn test_resolve_projects_buckets() {
        let raw: RawSchema = serde_json::from_str(
            r#"{
                "opt": {"values": ["-O0", "-O2"], "default": "-O2", "argname": "FLAGS"},
                "std": {"values": ["-std=c++17"], "argname": "FLAGS"},
                "time": {"type": "natural", "range": [1, 10], "default": 5, "valname": "TIME"}
            }"#,
        )
        .unwrap();
        let schema = OptionSchema::from_raw(&raw).unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert("time".to_string(), "20".to_string());
        overrides.insert("bogus".to_string(), "1".to_string());

        let (subs, diag) = schema.resolve(&overrides);
        assert_eq!(subs["FLAGS"], "-O2 -std=c++17");
        assert_eq!(subs["TIME"], "10");
        assert_eq!(diag.warnings.len(), 2);
        assert!(diag.errors.is_empty());
    }

    #[tokio::test]
    async fn test_load_merges_roots_in_priority_order() {
        let account = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        for (root, body) in [
            (account.path(), r#"{"time": {"type": "natural", "default": 2, "valname": "TIME"}}"#),
            (home.path(), r#"{"time": {"type": "natural", "default": 9, "valname": "TIME"}}"#),
        ] {
            std::fs::create_dir_all(root.join(TEMPLATE_DIR)).unwrap();
            std::fs::write(root.join(TEMPLATE_DIR).join(SCHEMA_FILE), body).unwrap();
        }

        let storage = LocalStorage::new();
        let roots = vec![account.path().to_path_buf(), home.path().to_path_buf()];
        let schema = OptionSchema::load(&storage, &roots).await.unwrap();
        let (subs, _) = schema.resolve(&BTreeMap::new());
        assert_eq!(subs["TIME"], "2");
    }

    #[tokio::test]
    async fn test_bad_schema_names_relative_path() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join(TEMPLATE_DIR)).unwrap();
        std::fs::write(root.path().join(TEMPLATE_DIR).join(SCHEMA_FILE), "{ nope").unwrap();

        let storage = LocalStorage::new();
        let err = OptionSchema::load(&storage, &[root.path().to_path_buf()])
            .await
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("template/template.options"));
    }
}

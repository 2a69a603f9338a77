//! Path mapping
//!
//! Rewrites paths authored on a submitting machine into paths valid on this
//! worker. Rules are applied most-specific first and only on whole path
//! components, so `/mnt/proj` never matches `/mnt/project`.

use crate::error::{Error, Result, ValidationError};
use crate::types::ActionArgs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable Arnold reads its path map file from
pub const ARNOLD_PATHMAP_ENV: &str = "ARNOLD_PATHMAP";

const ARNOLD_PATHMAP_FILE: &str = "arnold_pathmapping.json";

/// Path syntax of a rule's source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathFormat {
    Posix,
    Windows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMappingRule {
    pub source_path_format: PathFormat,
    pub source_path: String,
    pub destination_path: String,
}

impl PathMappingRule {
    pub fn new(source_path_format: PathFormat, source_path: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self {
            source_path_format,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
        }
    }

    fn source(&self) -> SplitPath {
        SplitPath::parse(&self.source_path, self.source_path_format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Relative,
    /// `/...`
    Slash,
    /// `\\server\share\...`
    Unc,
}

/// A path broken into root and components, compared per format
#[derive(Debug, Clone)]
struct SplitPath {
    format: PathFormat,
    root: Root,
    components: Vec<String>,
}

impl SplitPath {
    fn parse(path: &str, format: PathFormat) -> Self {
        let normalized = match format {
            PathFormat::Posix => path.to_string(),
            PathFormat::Windows => path.replace('\\', "/"),
        };
        let root = if format == PathFormat::Windows && normalized.starts_with("//") {
            Root::Unc
        } else if normalized.starts_with('/') {
            Root::Slash
        } else {
            Root::Relative
        };
        let components = normalized
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_string)
            .collect();
        Self { format, root, components }
    }

    fn component_eq(&self, a: &str, b: &str) -> bool {
        match self.format {
            PathFormat::Posix => a == b,
            PathFormat::Windows => a.eq_ignore_ascii_case(b),
        }
    }

    /// Components of `path` remaining after this prefix, if it is one
    fn strip<'p>(&self, path: &'p SplitPath) -> Option<&'p [String]> {
        if self.root != path.root || self.components.len() > path.components.len() {
            return None;
        }
        let matches = self
            .components
            .iter()
            .zip(&path.components)
            .all(|(a, b)| self.component_eq(a, b));
        matches.then(|| &path.components[self.components.len()..])
    }

    fn contains(&self, other: &SplitPath) -> bool {
        self.strip(other).is_some()
    }
}

/// Applies a validated rule set
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    /// Most specific source first
    rules: Vec<PathMappingRule>,
}

impl PathMapper {
    /// Validate and order the rules. Chained rule sets are rejected: no
    /// destination may lie inside another rule's source and no source inside
    /// another rule's destination.
    pub fn new(rules: Vec<PathMappingRule>) -> std::result::Result<Self, ValidationError> {
        for rule in &rules {
            if rule.source_path.trim().is_empty() || rule.destination_path.trim().is_empty() {
                return Err(ValidationError::InvalidPathMapping(format!(
                    "rule '{}' -> '{}' has an empty path",
                    rule.source_path, rule.destination_path
                )));
            }
        }

        for (i, a) in rules.iter().enumerate() {
            for (j, b) in rules.iter().enumerate() {
                let source = b.source();
                let destination = SplitPath::parse(&a.destination_path, b.source_path_format);
                let inside = source.contains(&destination);
                let around = destination.contains(&source);
                // A rule mapping a path onto itself is harmless.
                if i == j && inside && around {
                    continue;
                }
                if inside || around {
                    return Err(ValidationError::InvalidPathMapping(format!(
                        "destination '{}' overlaps source '{}'; chained mappings are not supported",
                        a.destination_path, b.source_path
                    )));
                }
            }
        }

        let mut rules = rules;
        rules.sort_by_key(|r| std::cmp::Reverse(r.source().components.len()));
        Ok(Self { rules })
    }

    /// Parse a JSON list of rules
    pub fn from_json(value: serde_json::Value) -> std::result::Result<Self, ValidationError> {
        let rules: Vec<PathMappingRule> = serde_json::from_value(value).map_err(|e| ValidationError::Malformed {
            what: "path mapping rules".to_string(),
            reason: e.to_string(),
        })?;
        Self::new(rules)
    }

    pub fn rules(&self) -> &[PathMappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Map a path with the first matching rule; unmatched paths are returned as is
    pub fn map(&self, path: &str) -> String {
        for rule in &self.rules {
            let source = rule.source();
            let candidate = SplitPath::parse(path, rule.source_path_format);
            if let Some(rest) = source.strip(&candidate) {
                let mapped = join(&rule.destination_path, rest);
                debug!("Mapped {} -> {}", path, mapped);
                return mapped;
            }
        }
        path.to_string()
    }

    /// Rules as `source -> destination` arguments for the `path_mapping` action
    pub fn to_action_args(&self) -> ActionArgs {
        let mut args = ActionArgs::new();
        for rule in &self.rules {
            args.insert(rule.source_path.clone(), rule.destination_path.clone());
        }
        args
    }

    /// Write the rules in Arnold's path map format into a private temporary
    /// directory. The directory lives as long as the returned handle.
    pub fn write_arnold_pathmap(&self) -> Result<ArnoldPathmap> {
        let rules: BTreeMap<String, String> = self
            .rules
            .iter()
            .map(|r| (r.source_path.replace('\\', "/"), r.destination_path.replace('\\', "/")))
            .collect();
        let mut document = BTreeMap::new();
        document.insert(arnold_os_name(), rules);

        let dir = tempfile::Builder::new().prefix("arnold").tempdir()?;
        let path = dir.path().join(ARNOLD_PATHMAP_FILE);
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&serde_json::to_vec(&document)?)?;
        file.sync_all()?;
        info!("Wrote Arnold path mapping to {}", path.display());

        Ok(ArnoldPathmap { _dir: dir, path })
    }
}

/// A written Arnold path map file; removed on drop
#[derive(Debug)]
pub struct ArnoldPathmap {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl ArnoldPathmap {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn arnold_os_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

fn join(destination: &str, rest: &[String]) -> String {
    let separator = if destination.contains('\\') && !destination.contains('/') {
        '\\'
    } else {
        '/'
    };
    let mut mapped = destination.trim_end_matches(['/', '\\']).to_string();
    if mapped.is_empty() {
        mapped.push(separator);
    }
    for component in rest {
        if !mapped.ends_with(separator) {
            mapped.push(separator);
        }
        mapped.push_str(component);
    }
    mapped
}

/// Parse rules from JSON text
pub fn parse_rules(text: &str) -> Result<PathMapper> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    PathMapper::from_json(value).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapper() -> PathMapper {
        PathMapper::new(vec![
            PathMappingRule::new(PathFormat::Posix, "/mnt/shows", "/data/shows"),
            PathMappingRule::new(PathFormat::Posix, "/mnt/shows/hero/cache", "/fast/cache"),
            PathMappingRule::new(PathFormat::Windows, "Z:\\assets", "/data/assets"),
        ])
        .unwrap()
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let m = mapper();
        assert_eq!(m.map("/mnt/shows/hero/cache/sim.abc"), "/fast/cache/sim.abc");
        assert_eq!(m.map("/mnt/shows/hero/scene.mb"), "/data/shows/hero/scene.mb");
        assert_eq!(m.map("/mnt/shows"), "/data/shows");
    }

    #[test]
    fn test_component_boundary() {
        let m = mapper();
        assert_eq!(m.map("/mnt/showsXYZ/a.mb"), "/mnt/showsXYZ/a.mb");
        assert_eq!(m.map("relative/mnt/shows"), "relative/mnt/shows");
    }

    #[test]
    fn test_windows_sources_are_case_insensitive() {
        let m = mapper();
        assert_eq!(m.map("z:\\Assets\\tex\\wood.tx"), "/data/assets/tex/wood.tx");
        assert_eq!(m.map("Z:/ASSETS/tex"), "/data/assets/tex");
    }

    #[test]
    fn test_mapping_is_idempotent() {
        let m = mapper();
        for path in ["/mnt/shows/a/b.mb", "Z:\\assets\\x.tx", "/elsewhere/c.mb", "/mnt/shows/hero/cache/s.abc"] {
            let once = m.map(path);
            assert_eq!(m.map(&once), once, "mapping {} twice changed it", path);
        }
    }

    #[test]
    fn test_chained_rules_are_rejected() {
        let err = PathMapper::new(vec![
            PathMappingRule::new(PathFormat::Posix, "/a", "/b"),
            PathMappingRule::new(PathFormat::Posix, "/b/sub", "/c"),
        ])
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPathMapping(_)));

        let err = PathMapper::new(vec![PathMappingRule::new(PathFormat::Posix, "/a", "/a/b")]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPathMapping(_)));

        assert!(PathMapper::new(vec![PathMappingRule::new(PathFormat::Posix, "/same", "/same")]).is_ok());
    }

    #[test]
    fn test_action_args_keep_rules() {
        let args = mapper().to_action_args();
        assert_eq!(args.len(), 3);
        assert_eq!(args.get_str("Z:\\assets"), Some("/data/assets"));
    }

    #[test]
    fn test_rules_from_json() {
        let m = parse_rules(
            r#"[{"source_path_format": "WINDOWS", "source_path": "C:\\proj", "destination_path": "/proj"}]"#,
        )
        .unwrap();
        assert_eq!(m.map("C:\\proj\\shot.mb"), "/proj/shot.mb");
        assert!(parse_rules(r#"[{"source_path": "/a"}]"#).is_err());
    }

    #[test]
    fn test_arnold_pathmap_file() {
        let m = PathMapper::new(vec![PathMappingRule::new(PathFormat::Windows, "C:\\proj", "/proj")]).unwrap();
        let pathmap = m.write_arnold_pathmap().unwrap();
        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(pathmap.path()).unwrap()).unwrap();
        assert_eq!(written[arnold_os_name()]["C:/proj"], "/proj");

        let dir = pathmap.path().parent().unwrap().to_path_buf();
        drop(pathmap);
        assert!(!dir.exists());
    }
}

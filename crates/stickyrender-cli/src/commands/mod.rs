//! Command implementations, one module per subcommand

pub mod client;
pub mod daemon;
pub mod run;

use anyhow::{Context, Result};
use std::path::Path;
use stickyrender_core::PathMapper;

/// Parse a JSON argument given inline or as `@path`
pub fn parse_json_arg(arg: &str) -> Result<serde_json::Value> {
    match arg.strip_prefix('@') {
        Some(path) => {
            let content = std::fs::read_to_string(Path::new(path)).with_context(|| format!("Failed to read {}", path))?;
            serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path))
        }
        None => serde_json::from_str(arg).context("Argument is not valid JSON"),
    }
}

pub fn parse_path_mapping(arg: Option<&str>) -> Result<PathMapper> {
    match arg {
        Some(arg) => Ok(PathMapper::from_json(parse_json_arg(arg)?)?),
        None => Ok(PathMapper::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inline_and_file_arguments() {
        assert_eq!(parse_json_arg(r#"{"frame": 3}"#).unwrap()["frame"], 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"frame": 7}"#).unwrap();
        let value = parse_json_arg(&format!("@{}", path.display())).unwrap();
        assert_eq!(value["frame"], 7);

        assert!(parse_json_arg("{not json").is_err());
        assert!(parse_json_arg("@/no/such/file.json").is_err());
    }

    #[test]
    fn test_path_mapping_argument() {
        assert!(parse_path_mapping(None).unwrap().is_empty());
        let mapper = parse_path_mapping(Some(
            r#"[{"source_path_format": "POSIX", "source_path": "/a", "destination_path": "/b"}]"#,
        ))
        .unwrap();
        assert_eq!(mapper.map("/a/x"), "/b/x");
    }
}

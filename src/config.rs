//! YAML config file: a declarative list of probe targets.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, TcpProbeError};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TargetSpec {
    pub addr: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Load the config file. An empty path yields an empty target list; an
/// unreadable file or malformed YAML is an error the caller treats as
/// fatal.
pub fn load(path: &str) -> Result<Config> {
    if path.is_empty() {
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(Path::new(path))
        .map_err(|err| TcpProbeError::Config(format!("{}: {}", path, err)))?;

    serde_yaml::from_str(&raw).map_err(|err| TcpProbeError::Config(format!("{}: {}", path, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("tcpprobe-config-{}.yml", nanos));
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(content.as_bytes()).expect("write");
        path
    }

    #[test]
    fn parses_targets() {
        let path = temp_file(
            "targets:
  - addr: https://www.google.com
    interval: 10s
    labels:
      pop: bur
",
        );

        let cfg = load(path.to_str().expect("path")).expect("load");
        assert_eq!(cfg.targets.len(), 1);
        assert_eq!(cfg.targets[0].addr, "https://www.google.com");
        assert_eq!(cfg.targets[0].interval, "10s");
        assert_eq!(
            cfg.targets[0].labels,
            HashMap::from([("pop".to_string(), "bur".to_string())])
        );

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn empty_path_means_no_targets() {
        let cfg = load("").expect("load");
        assert!(cfg.targets.is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load("notfound").is_err());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let path = temp_file("wrongyaml");
        assert!(load(path.to_str().expect("path")).is_err());
        let _ = std::fs::remove_file(path);
    }
}

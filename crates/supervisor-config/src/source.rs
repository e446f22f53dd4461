use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::spec::{ProgramSpec, RawProgramSpec};

/// The full set of validated programs read from one config load.
pub type ProgramSpecSet = BTreeMap<String, ProgramSpec>;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    programs: BTreeMap<String, RawProgramSpec>,
}

/// A source of program configuration, read under the supervisor lock on
/// every `reload` (spec.md §1: YAML parsing and file I/O are out of the
/// core's scope, hidden behind this trait).
pub trait ConfigSource {
    fn load(&self) -> Result<ProgramSpecSet, ConfigError>;
}

/// Loads `programs:` from a YAML file on disk.
pub struct YamlFileSource {
    path: PathBuf,
}

impl YamlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        YamlFileSource { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for YamlFileSource {
    fn load(&self) -> Result<ProgramSpecSet, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        parse_yaml(&text, &self.path)
    }
}

fn parse_yaml(text: &str, path: &Path) -> Result<ProgramSpecSet, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut programs = ProgramSpecSet::new();
    for (name, row) in raw.programs {
        let spec = ProgramSpec::from_raw(name.clone(), row)?;
        programs.insert(name, spec);
    }
    Ok(programs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_program() {
        let yaml = r#"
programs:
  ok:
    command: /bin/true
"#;
        let set = parse_yaml(yaml, Path::new("test.yaml")).unwrap();
        let spec = &set["ok"];
        assert_eq!(spec.command, "/bin/true");
        assert_eq!(spec.processes, 1);
        assert!(!spec.start_at_launch);
    }

    #[test]
    fn parses_exit_codes_as_scalar_or_list() {
        let yaml = r#"
programs:
  a:
    command: /bin/true
    exitcodes: 0
  b:
    command: /bin/true
    expected_exit_codes: [0, 2]
"#;
        let set = parse_yaml(yaml, Path::new("test.yaml")).unwrap();
        assert_eq!(set["b"].expected_exit_codes.len(), 2);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let source = YamlFileSource::new("/nonexistent/path/to/config.yaml");
        let err = source.load().unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

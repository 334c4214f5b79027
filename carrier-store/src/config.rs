use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::ValidationError;

/// Where the store keeps its files.
///
/// ```ron
/// Carrier (
///     storage: (
///         path: "/var/spool/carrier",
///     ),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/carrier"),
        }
    }
}

impl<'de> Deserialize<'de> for StoreConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper {
            #[serde(default = "default_path")]
            path: PathBuf,
        }

        let helper = Helper::deserialize(deserializer)?;
        validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { path: helper.path })
    }
}

fn default_path() -> PathBuf {
    StoreConfig::default().path
}

const SYSTEM_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// Rejects relative paths, `..` components and system directories.
pub fn validate_path(path: &Path) -> Result<(), ValidationError> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(ValidationError::ParentTraversal(path.display().to_string()));
    }

    if !path.is_absolute() {
        return Err(ValidationError::NotAbsolute(path.display().to_string()));
    }

    if let Some(prefix) = SYSTEM_PREFIXES.iter().find(|p| path.starts_with(p)) {
        return Err(ValidationError::SystemDirectory {
            prefix: (*prefix).to_string(),
            path: path.display().to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_spool_path() {
        let config: StoreConfig = ron::from_str(r#"(path: "/var/spool/relay")"#).unwrap();
        assert_eq!(config.path, PathBuf::from("/var/spool/relay"));
    }

    #[test]
    fn defaults_when_empty() {
        let config: StoreConfig = ron::from_str("()").unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn rejects_dangerous_paths() {
        assert!(ron::from_str::<StoreConfig>(r#"(path: "relative/dir")"#).is_err());
        assert!(ron::from_str::<StoreConfig>(r#"(path: "/var/../etc")"#).is_err());
        assert!(ron::from_str::<StoreConfig>(r#"(path: "/etc/carrier")"#).is_err());
    }
}

pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use parse::{load_config, parse_config, ConfigError};
pub use types::Config;

const ENV_VAR_PATTERN: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> Result<String, regex::Error> {
    let re = Regex::new(ENV_VAR_PATTERN)?;

    Ok(re
        .replace_all(text, |caps: &regex::Captures| {
            let name = caps.get(1).map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string())
}

/// Names of `$env{...}` references still present in `text`, sorted and
/// deduplicated.
pub fn unexpanded_env_vars(text: &str) -> Result<Vec<String>, regex::Error> {
    let re = Regex::new(ENV_VAR_PATTERN)?;
    let mut names: Vec<String> = re
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Expands tilde (~) in paths to the user's home directory.
/// Returns the path unchanged if it doesn't start with tilde or home directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/scorestream/config.yml
/// 3. /etc/scorestream/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(user_config) = default_user_config_path() {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/scorestream/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

pub fn default_user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config/scorestream/config.yml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_expand_env_vars_single() {
        std::env::set_var("SCORESTREAM_TEST_VAR", "test_value");
        let result = expand_env_vars("path/$env{SCORESTREAM_TEST_VAR}/file").unwrap();
        assert_eq!(result, "path/test_value/file");
        std::env::remove_var("SCORESTREAM_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_unset_left_unchanged() {
        let result = expand_env_vars("key: $env{SCORESTREAM_NONEXISTENT}").unwrap();
        assert_eq!(result, "key: $env{SCORESTREAM_NONEXISTENT}");
        assert_eq!(
            unexpanded_env_vars(&result).unwrap(),
            vec!["SCORESTREAM_NONEXISTENT"]
        );
    }

    #[test]
    fn test_unexpanded_env_vars_dedup() {
        let names = unexpanded_env_vars("$env{B} $env{A} $env{B} ${not_env}").unwrap();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/test/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("test/path"));
        }
    }

    #[test]
    fn test_expand_tilde_no_expansion() {
        assert_eq!(
            expand_tilde(Path::new("/absolute/path")),
            Path::new("/absolute/path")
        );
        assert_eq!(
            expand_tilde(Path::new("relative/path")),
            Path::new("relative/path")
        );
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/tmp/custom.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/custom.yml")));
    }
}

//! Config YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::AppConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                errors.push(var_name.to_string());
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", errors.join(", "));
    }

    Ok(result)
}

/// Parse a config YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<AppConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: AppConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse config YAML")?;
    Ok(config)
}

/// Parse a config YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("OB_TEST_DIR", "/srv/labels");
        let input = "label_source_dir: ${OB_TEST_DIR}";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "label_source_dir: /srv/labels");
        std::env::remove_var("OB_TEST_DIR");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "name: gemini-2.0-flash";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_missing_env_var_errors() {
        let result = substitute_env_vars("dir: ${OB_DEFINITELY_NOT_SET_12345}");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("OB_DEFINITELY_NOT_SET_12345"));
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let result = substitute_env_vars("${OB_MISSING_X} and ${OB_MISSING_Y}");
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("OB_MISSING_X"));
        assert!(err_msg.contains("OB_MISSING_Y"));
    }

    #[test]
    fn test_parse_config_from_string() {
        std::env::set_var("OB_TEST_OUTPUT", "/srv/out");
        let yaml = r"
paths:
  label_source_dir: /srv/labels
  image_source_dir: /srv/images
  output_dir: ${OB_TEST_OUTPUT}
model:
  name: gemini-2.0-flash
prompt:
  name: ocr
  template_file: page.txt
";
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.paths.output_dir, std::path::PathBuf::from("/srv/out"));
        std::env::remove_var("OB_TEST_OUTPUT");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let result = parse_config_str("this is not: [valid: yaml: {{{}}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_config_file_not_found() {
        let result = parse_config(Path::new("/nonexistent/config.yaml"));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to read config file"));
    }
}

// SPDX-License-Identifier: Apache-2.0

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use std::path::Path;

use crate::harvest::{Error, HarvestConfig};
use crate::init::args::AgentRun;
use crate::publisher::BoxError;

const ENV_PREFIX: &str = "ROUTEBEAT_";

/// Build the harvest configuration. Later sources win: built-in defaults,
/// the config file, `ROUTEBEAT_*` environment variables, then command line
/// flags.
pub fn load_config(args: &AgentRun) -> Result<HarvestConfig, BoxError> {
    let mut figment = Figment::from(Serialized::defaults(HarvestConfig::default()));

    if let Some(path) = &args.config {
        figment = merge_file(figment, path)?;
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX));

    let mut config: HarvestConfig = figment
        .extract()
        .map_err(|e| Error::Config(e.to_string()))?;

    if !args.paths.is_empty() {
        config.paths = args.paths.clone();
    }
    if !args.exclude.is_empty() {
        config.exclude = args.exclude.clone();
    }
    if let Some(registry_path) = &args.registry_path {
        config.registry_path = registry_path.clone();
    }
    if let Some(start_at) = args.start_at {
        config.start_at = start_at.into();
    }

    config.validate().map_err(Error::Config)?;
    Ok(config)
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment, BoxError> {
    if !path.is_file() {
        return Err(format!("config file not found: {}", path.display()).into());
    }

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        Ok(figment.merge(Toml::file(path)))
    } else {
        Ok(figment.merge(Yaml::file(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::StartAt;
    use crate::init::args::StartAtArg;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_toml_file() {
        let file = config_file(
            ".toml",
            r#"
paths = ["/var/log/app/*.log"]
start_at = "end"
spool_capacity = 128
"#,
        );
        let args = AgentRun {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = load_config(&args).unwrap();
        assert_eq!(config.paths, vec!["/var/log/app/*.log".to_string()]);
        assert_eq!(config.start_at, StartAt::End);
        assert_eq!(config.spool_capacity, 128);
        assert_eq!(config.publish_batch_size, 512);
    }

    #[test]
    fn test_load_yaml_file_with_cli_overrides() {
        let file = config_file(
            ".yaml",
            "paths:\n  - /var/log/*.log\nregistry_path: /tmp/from-file\n",
        );
        let args = AgentRun {
            config: Some(file.path().to_path_buf()),
            paths: vec!["/srv/logs/*.log".to_string()],
            start_at: Some(StartAtArg::End),
            ..Default::default()
        };

        let config = load_config(&args).unwrap();
        assert_eq!(config.paths, vec!["/srv/logs/*.log".to_string()]);
        assert_eq!(config.registry_path, PathBuf::from("/tmp/from-file"));
        assert_eq!(config.start_at, StartAt::End);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let file = config_file(".toml", "paths = []\n");
        let args = AgentRun {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(load_config(&args).is_err());

        let file = config_file(".toml", "paths = [\"/x/*.log\"]\nspool_capacity = \"lots\"\n");
        let args = AgentRun {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = AgentRun {
            config: Some(PathBuf::from("/nonexistent/routebeat.toml")),
            ..Default::default()
        };
        let err = load_config(&args).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }
}

use crate::config::AllocatorConfig;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Load and validate allocator configuration from a YAML file
pub fn load_config(config_path: &Path) -> Result<AllocatorConfig> {
    info!("Loading configuration from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open config file '{}'", config_path.display()))?;

    let config: AllocatorConfig = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse config file '{}'", config_path.display()))?;

    config.validate()?;

    Ok(config)
}

/// Resolve the effective configuration from an optional file and CLI overrides
pub fn resolve_config(
    config_path: Option<&Path>,
    state_dir_override: Option<PathBuf>,
) -> Result<AllocatorConfig> {
    let mut config = match config_path {
        Some(path) => load_config(path)?,
        None => AllocatorConfig::default(),
    };

    if let Some(state_dir) = state_dir_override {
        info!("State directory override: {:?}", state_dir);
        config.state_dir = state_dir;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let yaml = r#"
state_dir: "/var/lib/chainnet"
pools:
  bucket_count: 2
  bucket_capacity: 10
host_address: "192.168.4.2"
lock_timeout: "3s"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/chainnet"));
        assert_eq!(config.pools.bucket_count, 2);
        assert_eq!(config.pools.base_port, 30303);
        assert_eq!(config.host_address, Some(Ipv4Addr::new(192, 168, 4, 2)));
        assert_eq!(config.lock_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_load_invalid_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "pools:\n  bucket_capacity: 0\n").unwrap();

        assert!(load_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_state_dir_override() {
        let config = resolve_config(None, Some(PathBuf::from("/tmp/other"))).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/other"));
        assert_eq!(config.rpc.base_port, 8575);
    }
}

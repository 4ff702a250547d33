//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use std::path::PathBuf;
use tracing::info;

/// Initialize ragchat configuration and database
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<Config> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::AlreadyInitialized(
            config.paths.config_file.display().to_string(),
        ));
    }

    std::fs::create_dir_all(&config.paths.base_dir)?;
    config.save()?;

    let db = MetaDb::connect(&config).await?;
    db.init_schema().await?;

    info!("Initialized ragchat at {}", config.paths.base_dir.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_init_creates_config_and_schema() {
        let tmp = TempDir::new().unwrap();
        let config = cmd_init(Some(tmp.path().to_path_buf()), false).await.unwrap();

        assert!(config.is_initialized());
        let loaded = Config::load(&config.paths.config_file).unwrap();
        assert_eq!(loaded.chunk.max_tokens, config.chunk.max_tokens);

        let db = MetaDb::connect(&loaded).await.unwrap();
        assert!(db.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_init_refuses_overwrite_without_force() {
        let tmp = TempDir::new().unwrap();
        cmd_init(Some(tmp.path().to_path_buf()), false).await.unwrap();

        let err = assert_err!(cmd_init(Some(tmp.path().to_path_buf()), false).await);
        assert!(matches!(err, Error::AlreadyInitialized(_)));

        assert_ok!(cmd_init(Some(tmp.path().to_path_buf()), true).await);
    }
}

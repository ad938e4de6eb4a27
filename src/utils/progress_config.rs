// src/utils/progress_config.rs

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::env;

const STAGE_TEMPLATE: &str =
    "    {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Configuration for progress tracking of the matching runs
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Whether to show progress bars at all
    pub enabled: bool,
    /// Whether to show a bar per pipeline stage
    pub detailed: bool,
    /// Whether to show memory usage in phase messages
    pub show_memory: bool,
    /// Whether to show database connection pool statistics
    pub show_db_connection_stats: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detailed: true,
            show_memory: true,
            show_db_connection_stats: true,
        }
    }
}

impl ProgressConfig {
    /// Create progress configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            enabled: env::var("PROGRESS_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            detailed: env::var("PROGRESS_DETAILED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            show_memory: env::var("PROGRESS_SHOW_MEMORY")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            show_db_connection_stats: env::var("PROGRESS_SHOW_DB_CONNECTIONS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        }
    }

    /// Create a MultiProgress instance if progress is enabled, None otherwise
    pub fn create_multi_progress(&self) -> Option<MultiProgress> {
        if self.enabled {
            Some(MultiProgress::new())
        } else {
            None
        }
    }

    /// The MultiProgress handed to stages, None unless detailed bars are wanted
    pub fn stage_progress(&self, multi_progress: &Option<MultiProgress>) -> Option<MultiProgress> {
        if self.should_show_detailed() {
            multi_progress.clone()
        } else {
            None
        }
    }

    pub fn should_show_detailed(&self) -> bool {
        self.enabled && self.detailed
    }

    pub fn should_show_memory(&self) -> bool {
        self.enabled && self.show_memory
    }

    pub fn should_show_db_connection_stats(&self) -> bool {
        self.enabled && self.show_db_connection_stats
    }
}

/// A stage progress bar attached to `multi_progress`, or a hidden one.
pub fn stage_bar(multi_progress: Option<&MultiProgress>, len: u64, message: &str) -> Result<ProgressBar> {
    let pb = match multi_progress {
        Some(mp) => mp.add(ProgressBar::new(len)),
        None => ProgressBar::hidden(),
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template(STAGE_TEMPLATE)
            .context("Failed to set progress bar style")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = ProgressConfig::default();
        assert!(config.enabled);
        assert!(config.detailed);
        assert!(config.show_memory);
        assert!(config.show_db_connection_stats);
    }

    #[test]
    fn test_env_config() {
        env::set_var("PROGRESS_ENABLED", "false");
        env::set_var("PROGRESS_DETAILED", "false");
        env::set_var("PROGRESS_SHOW_MEMORY", "false");
        env::set_var("PROGRESS_SHOW_DB_CONNECTIONS", "false");

        let config = ProgressConfig::from_env();
        assert!(!config.enabled);
        assert!(!config.detailed);
        assert!(!config.show_memory);
        assert!(!config.show_db_connection_stats);

        env::remove_var("PROGRESS_ENABLED");
        env::remove_var("PROGRESS_DETAILED");
        env::remove_var("PROGRESS_SHOW_MEMORY");
        env::remove_var("PROGRESS_SHOW_DB_CONNECTIONS");
    }

    #[test]
    fn test_multi_progress_creation() {
        let mut config = ProgressConfig::default();

        config.enabled = true;
        let mp = config.create_multi_progress();
        assert!(mp.is_some());
        assert!(config.stage_progress(&mp).is_some());

        config.detailed = false;
        assert!(config.stage_progress(&mp).is_none());

        config.enabled = false;
        assert!(config.create_multi_progress().is_none());
    }

    #[test]
    fn test_should_show_methods() {
        let mut config = ProgressConfig::default();
        assert!(config.should_show_detailed());
        assert!(config.should_show_memory());
        assert!(config.should_show_db_connection_stats());

        config.enabled = false;
        assert!(!config.should_show_detailed());
        assert!(!config.should_show_memory());
        assert!(!config.should_show_db_connection_stats());
    }

    #[test]
    fn test_hidden_stage_bar() {
        let pb = stage_bar(None, 5, "keying").unwrap();
        pb.inc(5);
        assert_eq!(pb.position(), 5);
    }
}

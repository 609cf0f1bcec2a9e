//! Unit tests for configuration.

#[cfg(test)]
mod path_expansion_tests {
    use super::super::Config;
    use std::path::PathBuf;

    #[test]
    fn expand_path_handles_tilde() {
        let result = Config::expand_path("~/test");
        assert!(!result.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn expand_path_handles_absolute_path() {
        let result = Config::expand_path("/absolute/path");
        assert_eq!(result, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn expand_path_handles_relative_path() {
        let result = Config::expand_path("relative/path");
        assert_eq!(result, PathBuf::from("relative/path"));
    }
}

#[cfg(test)]
mod default_config_tests {
    use super::super::Config;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert!(config.database.to_string_lossy().ends_with("chatmerge.db"));
        assert_eq!(config.batch_size, crate::stream::DEFAULT_BATCH_SIZE);
        assert!(config.backups.enabled);
        assert!(config.backups.keep >= 1);
    }
}

#[cfg(test)]
mod round_trip_tests {
    use super::super::Config;
    use uuid::Uuid;

    #[test]
    fn save_and_reload_preserves_values() {
        let mut path = std::env::temp_dir();
        path.push(format!("chatmerge-config-test-{}", Uuid::new_v4()));
        path.push("config.toml");

        let mut config = Config::default();
        config.batch_size = 250;
        config.backups.keep = 7;
        config.save_to_path(&path).expect("save");

        let reloaded = Config::load_from_path(&path).expect("load");
        assert_eq!(reloaded.batch_size, 250);
        assert_eq!(reloaded.backups.keep, 7);
        assert_eq!(reloaded.database, config.database);
    }

    #[test]
    fn ensure_at_creates_defaults() {
        let mut path = std::env::temp_dir();
        path.push(format!("chatmerge-config-test-{}", Uuid::new_v4()));
        path.push("config.toml");

        assert!(!path.exists());
        let config = Config::ensure_at(&path).expect("ensure");
        assert!(path.exists());
        assert_eq!(config.batch_size, crate::stream::DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let mut path = std::env::temp_dir();
        path.push(format!("chatmerge-config-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("mkdir");
        path.push("config.toml");
        std::fs::write(&path, "batch_size = 42\n").expect("write");

        let config = Config::load_from_path(&path).expect("load");
        assert_eq!(config.batch_size, 42);
        assert!(config.backups.enabled);
    }
}

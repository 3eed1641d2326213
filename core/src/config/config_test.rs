#[cfg(test)]
mod tests {
    use std::fs;

    use rustc_hash::FxHashMap;
    use tempfile::tempdir;

    use crate::config::{
        DispatchConfig, ENV_CACHE_SIZE, ENV_FALLBACK_THRESHOLD, ENV_MEMOIZE, ENV_OPTIMIZE_THRESHOLD, MAX_CACHE_CAPACITY,
    };
    use crate::error::DispatchError;

    fn vars(pairs: &[(&str, &str)]) -> FxHashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.cache_capacity, 4);
        assert_eq!(config.optimize_threshold, 10_000);
        assert_eq!(config.fallback_threshold, 8);
        assert_eq!(config.megamorphic_multiplier, 4);
        assert!(config.memoize_resolutions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        for bad in [
            DispatchConfig {
                cache_capacity: 0,
                ..DispatchConfig::default()
            },
            DispatchConfig {
                cache_capacity: MAX_CACHE_CAPACITY + 1,
                ..DispatchConfig::default()
            },
            DispatchConfig {
                megamorphic_multiplier: 0,
                ..DispatchConfig::default()
            },
            DispatchConfig {
                memo_capacity: 0,
                ..DispatchConfig::default()
            },
        ] {
            assert!(matches!(bad.validate(), Err(DispatchError::InvalidConfig(_))), "{bad:?}");
        }
        let no_memo = DispatchConfig {
            memoize_resolutions: false,
            memo_capacity: 0,
            ..DispatchConfig::default()
        };
        assert!(no_memo.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let env = vars(&[
            (ENV_CACHE_SIZE, "8"),
            (ENV_OPTIMIZE_THRESHOLD, "20_000"),
            (ENV_FALLBACK_THRESHOLD, " 0 "),
            (ENV_MEMOIZE, "off"),
        ]);
        let config = DispatchConfig::default()
            .with_overrides(|name| env.get(name).cloned())
            .unwrap();
        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.optimize_threshold, 20_000);
        assert_eq!(config.fallback_threshold, 0);
        assert!(!config.memoize_resolutions);
        assert_eq!(config.stable_window, DispatchConfig::default().stable_window);
    }

    #[test]
    fn test_bad_override_is_reported_with_variable_name() {
        let env = vars(&[(ENV_OPTIMIZE_THRESHOLD, "lots")]);
        let err = DispatchConfig::default()
            .with_overrides(|name| env.get(name).cloned())
            .unwrap_err();
        assert!(err.to_string().contains(ENV_OPTIMIZE_THRESHOLD));

        let env = vars(&[(ENV_MEMOIZE, "maybe")]);
        assert!(DispatchConfig::default()
            .with_overrides(|name| env.get(name).cloned())
            .is_err());

        let env = vars(&[(ENV_CACHE_SIZE, "0")]);
        let err = DispatchConfig::default()
            .with_overrides(|name| env.get(name).cloned())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file_reads_each_format() {
        let dir = tempdir().unwrap();
        let toml_path = dir.path().join("dispatch.toml");
        fs::write(&toml_path, "cache_capacity = 6\noptimize_threshold = 50\n").unwrap();
        let yaml_path = dir.path().join("dispatch.yml");
        fs::write(&yaml_path, "cache_capacity: 2\nmemoize_resolutions: false\n").unwrap();
        let json_path = dir.path().join("dispatch.json");
        fs::write(&json_path, r#"{"fallback_threshold": 3, "stable_window": 10}"#).unwrap();

        let from_toml = DispatchConfig::from_file(&toml_path).unwrap();
        assert_eq!(from_toml.cache_capacity, 6);
        assert_eq!(from_toml.optimize_threshold, 50);
        assert_eq!(from_toml.fallback_threshold, 8);

        let from_yaml = DispatchConfig::from_file(&yaml_path).unwrap();
        assert_eq!(from_yaml.cache_capacity, 2);
        assert!(!from_yaml.memoize_resolutions);

        let from_json = DispatchConfig::from_file(&json_path).unwrap();
        assert_eq!(from_json.fallback_threshold, 3);
        assert_eq!(from_json.stable_window, 10);
    }

    #[test]
    fn test_from_file_rejects_bad_input() {
        let dir = tempdir().unwrap();

        let ini = dir.path().join("dispatch.ini");
        fs::write(&ini, "cache_capacity=4").unwrap();
        let err = DispatchConfig::from_file(&ini).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));

        let unknown = dir.path().join("dispatch.toml");
        fs::write(&unknown, "cache_size = 4\n").unwrap();
        assert!(DispatchConfig::from_file(&unknown).is_err());

        let invalid = dir.path().join("dispatch.json");
        fs::write(&invalid, r#"{"cache_capacity": 0}"#).unwrap();
        assert!(DispatchConfig::from_file(&invalid).is_err());

        assert!(DispatchConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = DispatchConfig {
            cache_capacity: 3,
            optimize_threshold: 77,
            ..DispatchConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(toml::from_str::<DispatchConfig>(&text).unwrap(), config);
    }
}

//! TOML overlay onto a config struct's defaults.

/// Builds `$config_type` from `Default::default()` and overlays the listed
/// fields found in the optional TOML string. A key outside the listed fields,
/// a TOML syntax error or a type mismatch fails with `PitrError`.
///
/// ```no_compile
/// let cfg = parsed_config!(Some(raw) => CoordConfig; poll_interval_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let raw: Option<&str> = $config_str;
        let overlay = |raw: &str| -> Result<$config_type, $crate::PitrError> {
            let mut table = raw.parse::<toml::Table>()?;
            let mut parsed: $config_type = Default::default();
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    parsed.$field = value.try_into()?;
                }
            )+
            match table.keys().next() {
                Some(key) => Err($crate::PitrError::msg(format!(
                    "unknown config key '{}'",
                    key
                ))),
                None => Ok(parsed),
            }
        };
        match raw {
            Some(raw) => overlay(raw),
            None => Ok(<$config_type>::default()),
        }
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::PitrError;

    #[derive(Debug, PartialEq)]
    struct ReplayKnobs {
        batch: usize,
        codec: String,
        stale_sec: f64,
    }

    impl Default for ReplayKnobs {
        fn default() -> Self {
            ReplayKnobs {
                batch: 100,
                codec: "s2".into(),
                stale_sec: 30.0,
            }
        }
    }

    #[test]
    fn no_overlay_gives_defaults() -> Result<(), PitrError> {
        let knobs =
            parsed_config!(None => ReplayKnobs; batch, codec, stale_sec)?;
        assert_eq!(knobs, ReplayKnobs::default());
        Ok(())
    }

    #[test]
    fn overlay_some_fields() -> Result<(), PitrError> {
        let raw = Some("codec = 'zstd'\nbatch = 7");
        let knobs = parsed_config!(raw => ReplayKnobs; batch, codec)?;
        assert_eq!(
            knobs,
            ReplayKnobs {
                batch: 7,
                codec: "zstd".into(),
                stale_sec: 30.0,
            }
        );
        Ok(())
    }

    #[test]
    fn unlisted_key_rejected() {
        // stale_sec exists on the struct but is not listed
        let raw = Some("stale_sec = 5.0");
        let e = parsed_config!(raw => ReplayKnobs; batch).unwrap_err();
        assert!(e.to_string().contains("stale_sec"));
    }

    #[test]
    fn mistyped_value_rejected() {
        let raw = Some("batch = 'many'");
        assert!(parsed_config!(raw => ReplayKnobs; batch).is_err());
    }
}

//! Deserializers.

/// Translate a numerical debug level (the `MIRROR_DEBUG_LOG` scale, `0`
/// silent through `4` wire-level) into a log filter.
pub fn loglevel_from_verbosity(numlevel: u8) -> log::LevelFilter {
    match numlevel {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Parse a debug-level environment value into a log filter.
pub fn loglevel_from_env(value: &str) -> anyhow::Result<log::LevelFilter> {
    let numlevel: u8 = value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid debug level '{}': {}", value, e))?;
    if numlevel > 4 {
        anyhow::bail!("debug level {} out of range [0,4]", numlevel);
    }
    Ok(loglevel_from_verbosity(numlevel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loglevel_mapping() {
        assert_eq!(loglevel_from_verbosity(0), log::LevelFilter::Off);
        assert_eq!(loglevel_from_verbosity(2), log::LevelFilter::Info);
        assert_eq!(loglevel_from_verbosity(4), log::LevelFilter::Trace);
    }

    #[test]
    fn loglevel_env_bounds() {
        assert_eq!(loglevel_from_env(" 3 ").unwrap(), log::LevelFilter::Debug);
        assert!(loglevel_from_env("5").is_err());
        assert!(loglevel_from_env("verbose").is_err());
    }
}

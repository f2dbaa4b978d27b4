//! Settings overlay plumbing.
//!
//! Runtime settings start from hard-coded defaults and are then layered
//! over by increasingly specific sources (CLI flags, then environment
//! fallbacks). Each source only writes the fields it actually carries;
//! everything else keeps whatever the previous layer decided.

#[macro_export]
/// Overwrite `$target` when `$value` carries something.
///
/// `None` leaves the target untouched, so layering order alone decides
/// which source wins a field.
macro_rules! overlay_if_some {
    ( $target:expr, $value:expr ) => {
        if let Some(inner) = $value {
            $target = inner.into();
        }
    };
}

/// One overlay step of the settings assembly.
///
/// Implementations consume a source of optional, stringly-typed options
/// and fold the populated ones into `self`. Cross-field validation does
/// not belong here; it runs once, after the last overlay.
pub trait MergeOptions<T> {
    /// Fold the populated fields of `options` into these settings.
    fn try_merge(&mut self, options: T) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    #[derive(Default)]
    struct Settings {
        host: String,
        port: u16,
    }

    #[test]
    fn overlay_only_touches_populated_fields() {
        let mut settings = Settings {
            host: "localhost".to_string(),
            port: 8080,
        };

        overlay_if_some!(settings.host, Some("r.example"));
        overlay_if_some!(settings.port, None::<u16>);
        assert_eq!(settings.host, "r.example");
        assert_eq!(settings.port, 8080);

        overlay_if_some!(settings.port, Some(9090u16));
        assert_eq!(settings.port, 9090);
    }
}

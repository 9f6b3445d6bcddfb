//! Resolver selection and root configuration.
//!
//! Backend selection is a pure data value passed into root construction.
//! The `DIRJAIL_RESOLVER` environment variable is consulted only by
//! [`RootConfig::from_env`]; nothing in the workspace reads ambient state
//! behind the caller's back.

/// Environment variable overriding the resolver backend at root
/// construction time. Accepted values: `kernel`, `emulated`.
pub const RESOLVER_ENV_VAR: &str = "DIRJAIL_RESOLVER";

/// Strategy used to walk a path inside a confinement root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    /// A single `openat2(2)` call with in-kernel confinement enforcement.
    /// Requires Linux 5.6 or later; falls back to [`Emulated`] per call
    /// when the kernel rejects the primitive.
    ///
    /// [`Emulated`]: Self::Emulated
    KernelAssisted,
    /// Component-by-component walk built from `openat(2)`, `readlinkat(2)`
    /// and `fstatat(2)`, with explicit symlink and ancestor tracking.
    Emulated,
}

impl ResolverKind {
    /// Parses a `DIRJAIL_RESOLVER` value.
    fn parse(value: &str) -> Option<Self> {
        match value {
            "kernel" => Some(Self::KernelAssisted),
            "emulated" => Some(Self::Emulated),
            _ => None,
        }
    }
}

/// Configuration applied when opening a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootConfig {
    /// Resolver backend to use. `None` selects the auto-detected default
    /// (kernel-assisted when the host kernel supports `openat2(2)`).
    pub resolver: Option<ResolverKind>,
}

impl RootConfig {
    /// Builds a configuration with an explicit resolver backend.
    pub fn with_resolver(resolver: ResolverKind) -> Self {
        Self {
            resolver: Some(resolver),
        }
    }

    /// Builds a configuration from the process environment.
    ///
    /// An unset `DIRJAIL_RESOLVER` leaves the resolver auto-detected; an
    /// unrecognized value is ignored with a warning rather than failing
    /// root construction.
    pub fn from_env() -> Self {
        let resolver = match std::env::var(RESOLVER_ENV_VAR) {
            Ok(value) => {
                let parsed = ResolverKind::parse(&value);
                if parsed.is_none() {
                    tracing::warn!(%value, "ignoring unrecognized {RESOLVER_ENV_VAR} value");
                }
                parsed
            }
            Err(_) => None,
        };
        Self { resolver }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_resolver_names() {
        assert_eq!(
            ResolverKind::parse("kernel"),
            Some(ResolverKind::KernelAssisted)
        );
        assert_eq!(ResolverKind::parse("emulated"), Some(ResolverKind::Emulated));
        assert_eq!(ResolverKind::parse("openat3"), None);
    }

    #[test]
    fn default_config_is_auto() {
        assert_eq!(RootConfig::default().resolver, None);
    }

    #[test]
    fn explicit_resolver_is_kept() {
        let config = RootConfig::with_resolver(ResolverKind::Emulated);
        assert_eq!(config.resolver, Some(ResolverKind::Emulated));
    }
}

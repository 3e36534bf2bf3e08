//! Generic configuration loader utilities.
//!
//! Reusable helpers that eliminate boilerplate in configuration structs:
//! every field is loaded from an environment variable with a typed default.

/// Helper trait for parsing environment variables with defaults.
pub trait EnvLoader: Sized {
    /// Parse a value from an environment variable with fallback.
    fn from_env_or_default(key: &str, default: Self) -> Self {
        std::env::var(key).ok().and_then(|v| Self::parse_str(&v)).unwrap_or(default)
    }

    /// Parse a value from an environment variable (optional).
    fn from_env(key: &str) -> Option<Self> {
        std::env::var(key).ok().and_then(|v| Self::parse_str(&v))
    }

    /// Parse from string.
    fn parse_str(s: &str) -> Option<Self>;
}

impl EnvLoader for u64 {
    fn parse_str(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl EnvLoader for u32 {
    fn parse_str(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl EnvLoader for u16 {
    fn parse_str(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl EnvLoader for usize {
    fn parse_str(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl EnvLoader for f64 {
    fn parse_str(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl EnvLoader for bool {
    fn parse_str(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl EnvLoader for String {
    fn parse_str(s: &str) -> Option<Self> {
        Some(s.to_string())
    }
}

impl EnvLoader for Vec<String> {
    /// Comma-separated list; empty segments are dropped.
    fn parse_str(s: &str) -> Option<Self> {
        Some(s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect())
    }
}

impl<T: EnvLoader> EnvLoader for Option<T> {
    fn parse_str(s: &str) -> Option<Self> {
        Some(T::parse_str(s))
    }
}

/// Macro to reduce boilerplate in config loading.
///
/// Generates `load()` and `apply_env_overrides()` methods that read each
/// listed field from its environment variable, falling back to the struct's
/// `Default` value.
#[macro_export]
macro_rules! impl_config_loader {
    (
        $struct_name:ident {
            $($field:ident: $env_var:literal),* $(,)?
        }
    ) => {
        impl $struct_name {
            /// Load configuration from environment variables.
            pub fn load() -> Self {
                let defaults = Self::default();
                Self {
                    $(
                        $field: $crate::config::loader::EnvLoader::from_env_or_default(
                            $env_var,
                            defaults.$field,
                        ),
                    )*
                }
            }

            /// Apply environment variable overrides to existing configuration.
            pub fn apply_env_overrides(&mut self) {
                $(
                    if let Some(val) = $crate::config::loader::EnvLoader::from_env($env_var) {
                        self.$field = val;
                    }
                )*
            }
        }
    };
}

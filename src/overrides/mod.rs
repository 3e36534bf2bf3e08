//! Namespaces, overrides, and policy resolution.
//!
//! An override replaces request-supplied limit parameters for an identifier
//! pattern inside a namespace. Resolution runs on every limit call, backed
//! by the tiered cache; administration runs through [`OverrideAdmin`].

pub mod admin;
pub mod resolver;
pub mod store;
pub mod types;
pub mod wildcard;

pub use admin::AdminError;
pub use admin::NamespaceSelector;
pub use admin::OverrideAdmin;
pub use admin::OverrideParams;
pub use resolver::OverrideResolver;
pub use resolver::ResolveError;
pub use resolver::ResolvedPolicy;
pub use store::CreateOutcome;
pub use store::MemoryPrimaryStore;
pub use store::NamespaceStore;
pub use store::OverrideStore;
pub use store::PrimaryStore;
pub use store::StoreError;
pub use types::EffectivePolicy;
pub use types::LimitDefaults;
pub use types::Namespace;
pub use types::RatelimitOverride;
pub use types::Sharding;

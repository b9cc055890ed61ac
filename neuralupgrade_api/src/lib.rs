pub mod constants;
pub mod error;
pub mod status;

/// Key/value pairs carried by a trusted comment or a boot info comment.
pub type Metadata = std::collections::BTreeMap<String, String>;

/// Cache eviction policies.
pub mod eviction;

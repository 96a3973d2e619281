pub mod config;
pub mod group_store;
pub mod grouper;
pub mod hash;
pub mod hash_cache;
pub mod integrity;
pub mod metadata;
pub mod presenter;
pub mod review;
pub mod scanner;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

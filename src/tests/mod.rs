#[cfg(feature = "service")]
pub mod helpers;
#[cfg(feature = "service")]
mod identity;
#[cfg(feature = "service")]
mod index_store;

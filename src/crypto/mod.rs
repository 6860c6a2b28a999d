pub mod keys;

pub use keys::{KeyError, WgKey};

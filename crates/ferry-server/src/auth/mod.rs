//! Host identity and client authentication

mod keys;

pub use keys::{check_token, load_or_generate_host_key};

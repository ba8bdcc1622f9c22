pub mod password;
pub mod token;
pub mod validation;

pub use password::{CredentialHasher, Password, PasswordHashString};
pub use token::{generate_token, hash_token, hashes_match};

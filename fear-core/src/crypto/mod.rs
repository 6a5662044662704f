pub mod gcm;
pub mod key;

pub use gcm::{CryptoError, NONCE_LEN, TAG_LEN, decrypt, encrypt, generate_nonce};
pub use key::{KEY_LEN, KeyError, SessionKey};

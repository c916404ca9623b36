pub mod error;
pub mod keystore;

pub use error::{FsError, FsResult};
pub use keystore::{BlockMacGenerator, Hash, KeyHandle, KeyStore, SoftwareKeyStore, HASH_SIZE};

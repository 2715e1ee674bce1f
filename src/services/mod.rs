pub mod file_storage;
pub mod secret_protection;

pub use file_storage::FileStorageService;
pub use secret_protection::SecretProtector;

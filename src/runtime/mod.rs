pub mod cancel;
pub mod context;
pub mod file_storage;
pub mod identity;
pub mod redis_storage;
pub mod storage;

//! Object storage backends

mod fs;
mod traits;


pub use fs::FsObjectStorage;
pub use traits::{
    validate_bucket_name, validate_key, ObjectEntry, ObjectInfo, ObjectStorage, PutObjectResult,
    StorageError, StoredObject,
};

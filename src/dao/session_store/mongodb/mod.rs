mod config;
mod connection;
mod error;
mod models;
pub mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoSessionStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::RoomCodeTaken { code } => {
                StorageError::Conflict(format!("room code `{code}` already in use"))
            }
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}

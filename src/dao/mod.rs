/// Database model definitions.
pub mod models;
/// Session, membership, turn and progress persistence.
pub mod session_store;
/// Storage abstraction layer for database operations.
pub mod storage;

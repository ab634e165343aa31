//! Persistence pipeline: ordered write queue, TimescaleDB access, and the
//! shared-memory mirror.

pub mod db;
pub mod queue;
pub mod shm;

pub use db::Database;
pub use queue::PersistQueue;
pub use shm::SharedMemory;

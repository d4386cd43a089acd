pub mod database;
pub mod error;
pub mod machines;
pub mod schema;
pub mod tasks;

pub use database::Database;
pub use error::StoreError;
pub use machines::MachineRepo;
pub use tasks::TaskRepo;

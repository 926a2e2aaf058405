//! MongoDB access for the durable tier.

mod mongo;

pub use mongo::Database;

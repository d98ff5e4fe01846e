//! Items API: persistence backends and cached route handlers.

mod handler;
mod keys;
mod sqlite;
mod store;
mod types;

#[allow(unused_imports)]
pub use handler::Response;
pub use handler::ItemsHandler;
pub use sqlite::SqliteItemStore;
pub use store::{ItemStore, MemoryItemStore};
pub use types::{Item, ListQuery, NewItem};

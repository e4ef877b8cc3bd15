//! Miscellaneous common structs used throughout the library.

mod id;
mod item;
pub mod kbucket;
pub mod messages;
mod peer;
mod routing_table;

pub use id::*;
pub use item::*;
pub use messages::*;
pub use peer::*;
pub use routing_table::*;

pub mod handle;
pub mod listener;
pub mod payload;
pub(crate) mod record;
pub mod types;


pub use handle::*;
pub use listener::*;
pub use payload::*;
pub use record::Task;
pub use types::*;

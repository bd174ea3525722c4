pub mod async_task;
mod combinations;
mod path;

pub use combinations::*;
pub use path::*;

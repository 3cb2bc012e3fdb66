pub use message::*;
pub use reader::*;
pub use writer::*;

mod message;
mod reader;
pub mod wire;
mod writer;

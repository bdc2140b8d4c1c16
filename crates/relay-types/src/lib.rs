pub mod message;
pub mod permission;
pub mod tool;

pub use message::*;
pub use permission::*;
pub use tool::*;

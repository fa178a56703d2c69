pub mod comment;
pub mod issue;
pub mod project;
pub mod search;
pub mod server_info;

pub use comment::*;
pub use issue::*;
pub use project::*;
pub use search::*;
pub use server_info::*;

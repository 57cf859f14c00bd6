pub mod authenticated_user;
pub mod owner;
pub use authenticated_user::*;
pub use owner::*;

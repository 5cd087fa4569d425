pub mod command;
pub mod history;
pub mod member;
pub mod template;
pub mod user;
pub mod virtual_database;

pub use command::*;
pub use history::*;
pub use member::*;
pub use template::*;
pub use user::*;
pub use virtual_database::*;

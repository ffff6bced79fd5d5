pub mod common;
pub mod conflicts;
pub mod logs;
pub mod scan;
pub mod status;
pub mod sync;
pub mod users;

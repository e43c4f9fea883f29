pub mod manager;
pub mod messages;
pub mod session;
pub mod subscription;

pub use manager::{StreamConfig, StreamManager};
pub use session::{drive_session, SessionConnection};

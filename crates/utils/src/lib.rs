pub mod config;
pub mod log_msg;
pub mod msg_store;
pub mod secret;
pub mod text;

pub use config::{Config, ConfigError, ContainerInContainerMode};
pub use log_msg::LogMsg;
pub use msg_store::MsgStore;

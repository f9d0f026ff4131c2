pub mod broadcast;
pub mod connctx;
pub mod handler;
pub mod hub;
pub mod locks;
pub mod presence;
pub mod userctx;

pub use hub::{HubSettings, HubSnapshot, SessionHub};

pub mod backoff;
pub mod collab_client;

pub use backoff::{Backoff, ReconnectPolicy};
pub use collab_client::{ClientError, ClientEvent, ClientState, CollabClient};

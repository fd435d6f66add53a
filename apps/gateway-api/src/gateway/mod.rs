pub mod events;
pub mod fanout;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;

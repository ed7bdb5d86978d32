pub mod app;
pub mod dequeue;
pub mod heartbeat;
pub mod jobs;

pub use app::add_routes;

pub mod health;
pub mod message;
pub mod notification;
pub mod payload;
pub mod render;
pub mod retry;
pub mod status;

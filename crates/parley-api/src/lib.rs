pub mod admin;
pub mod auth;
pub mod messages;
pub mod middleware;
pub mod users;

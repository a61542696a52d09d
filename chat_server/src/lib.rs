pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod housekeeping;
pub mod hub;
pub mod messages;
pub mod model;
pub mod presence;
pub mod reads;
pub mod registry;
pub mod rooms;
pub mod store;
pub mod subscriptions;
pub mod typing;
pub mod ws;

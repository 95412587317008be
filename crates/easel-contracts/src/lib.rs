pub mod catalog;
pub mod credentials;
pub mod events;
pub mod tasks;

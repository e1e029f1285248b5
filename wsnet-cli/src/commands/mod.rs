pub mod daemon;
pub mod health;
pub mod version;

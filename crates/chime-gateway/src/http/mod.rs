pub mod confirm;
pub mod health;

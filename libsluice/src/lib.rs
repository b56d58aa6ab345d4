pub mod amount;
pub mod app_logic;
pub mod app_session;
pub mod chain;
pub mod channel;
pub mod helpers;
pub mod session;
pub mod signing;
pub mod types;

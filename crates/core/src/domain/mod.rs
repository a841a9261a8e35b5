pub mod actor;
pub mod audit;
pub mod booking;
pub mod request;

pub mod admin;
pub mod proxy;
pub mod request_id;

pub mod claims;
pub mod confirm;
pub mod extractors;
pub mod jwt;
pub mod password;
pub mod policy;

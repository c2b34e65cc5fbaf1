pub mod catalog;
pub mod chaos;
pub mod context;
pub mod deploy;
pub mod environment;
pub mod provision;

pub mod auth;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod error;
pub mod limits;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod registry;
pub mod service;
pub mod sql;
pub mod tls;
pub mod validator;
pub mod wal;
pub mod wire;

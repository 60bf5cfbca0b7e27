pub mod authz;
pub mod bootstrap;
pub mod challenge;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod sweeper;
pub mod token;
pub mod webauthn;

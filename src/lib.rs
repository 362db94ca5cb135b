pub mod adapter;
pub mod config;
pub mod digest;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod ledger;
pub mod oracle;
pub mod output;
pub mod pipeline;
pub mod providers;
pub mod resolver;
pub mod retention;
pub mod retry;
pub mod sync;
pub mod transform;

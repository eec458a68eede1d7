pub mod env;
pub mod jsonrpc;

pub mod headless;
pub mod json;
pub mod rpc;

pub use headless::run_headless_mode;
pub use json::run_json_mode;
pub use rpc::run_rpc_mode;

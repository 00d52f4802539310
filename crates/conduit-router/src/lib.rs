pub mod proxy;

pub use proxy::{error_response, proxy_router};

pub mod router;

pub use router::admin_router;

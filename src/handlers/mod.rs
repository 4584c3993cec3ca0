pub mod router;
pub mod traits;

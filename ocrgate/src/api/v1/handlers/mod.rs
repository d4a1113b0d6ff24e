pub(crate) mod health;
pub mod ocr;
pub mod providers;

pub use health::health_check;

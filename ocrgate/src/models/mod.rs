mod provider;
mod request;
mod result;

pub use provider::*;
pub use request::*;
pub use result::*;

mod lease;
mod resource;

pub use lease::*;
pub use resource::*;

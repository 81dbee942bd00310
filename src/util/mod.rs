pub mod slab;

pub use slab::{Key, Slab};

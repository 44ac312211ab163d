pub mod error_area;

pub use error_area::ErrorArea;

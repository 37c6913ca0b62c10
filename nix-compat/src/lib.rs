pub mod nixbase32;
pub mod nixcpp;
pub mod store_path;

pub mod solarflare;
pub mod structs;

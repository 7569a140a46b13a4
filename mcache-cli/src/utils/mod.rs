mod size;

pub use self::size::format_bytes;
pub use self::size::parse_size;

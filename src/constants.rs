/// Manufacturer identifier constants to ensure consistency across the codebase.
/// These are the keys used in the study configuration, the adapter registry,
/// and output filenames.

pub const AEROQUAL: &str = "aeroqual";
pub const AQMESH: &str = "aqmesh";
pub const ZEPHYR: &str = "zephyr";
pub const QUANTAQ: &str = "quantaq";

/// All manufacturer ids with a built-in adapter.
pub fn supported_manufacturers() -> Vec<&'static str> {
    vec![AEROQUAL, AQMESH, ZEPHYR, QUANTAQ]
}

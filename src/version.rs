// Centralized version information

// Human-facing firmware version, reported in boot logs
pub const FIRMWARE_VERSION: &str = "v0.3-sentinel";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including Cargo version
pub fn full_version() -> String {
    format!("{} ({})", FIRMWARE_VERSION, CARGO_VERSION)
}

use std::env;
use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Host builds (cargo test on the workspace) have no ESP-IDF environment
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();

        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    println!("cargo:rerun-if-changed=wifi_config.h");

    // Read WiFi configuration if it exists
    let wifi_config_path = "wifi_config.h";
    let contents = if Path::new(wifi_config_path).exists() {
        fs::read_to_string(wifi_config_path)?
    } else {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
        String::new()
    };

    println!("cargo:rustc-env=WIFI_SSID={}", define_value(&contents, "WIFI_SSID"));
    println!("cargo:rustc-env=WIFI_PASSWORD={}", define_value(&contents, "WIFI_PASSWORD"));

    // Optional broker overrides, e.g. SENTINEL_BROKER_URL=mqtts://mq.lan:8883 cargo build
    for key in ["SENTINEL_BROKER_URL", "SENTINEL_DEVICE_ID"] {
        println!("cargo:rerun-if-env-changed={}", key);
        if let Ok(value) = env::var(key) {
            println!("cargo:rustc-env={}={}", key, value);
        }
    }

    Ok(())
}

/// Value of `#define NAME "value"`, or empty when absent.
fn define_value<'a>(contents: &'a str, name: &str) -> &'a str {
    let directive = format!("#define {}", name);
    contents
        .lines()
        .find(|l| l.trim_start().starts_with(&directive))
        .and_then(|l| l.split('"').nth(1))
        .unwrap_or("")
}

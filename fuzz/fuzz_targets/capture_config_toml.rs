#![no_main]

use libfuzzer_sys::fuzz_target;
use tasksnap_core::config::{CaptureConfig, Config};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = Config::from_toml_str(text) {
        assert!(config.capture.validate().is_ok());
    }
    if let Ok(capture) = CaptureConfig::from_toml_str(text) {
        assert!(capture.max_stack_depth >= 1);
        assert!(capture.growth_headroom.is_finite() && capture.growth_headroom >= 1.0);
        assert!(capture.max_retries >= 1);
    }
});

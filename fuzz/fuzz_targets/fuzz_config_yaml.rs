#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = serde_yaml::from_str::<evcm::AppConfig>(text) {
        let _ = config.validate();
        for charger in &config.chargers {
            let _ = charger.validation_issues();
            let _ = charger.watched_entities();
        }
    }
});

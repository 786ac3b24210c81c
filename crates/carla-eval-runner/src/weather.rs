//! Weather presets understood by the simulator.
//!
//! The driver accepts either spelling, so the orchestrator only uses this
//! table to list presets and to warn on names it has never heard of.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeatherPreset {
    pub internal: &'static str,
    pub display: &'static str,
}

pub const PRESETS: &[WeatherPreset] = &[
    WeatherPreset { internal: "ClearNoon", display: "Clear Noon" },
    WeatherPreset { internal: "CloudyNoon", display: "Cloudy Noon" },
    WeatherPreset { internal: "WetNoon", display: "Wet Noon" },
    WeatherPreset { internal: "WetCloudyNoon", display: "Wet Cloudy Noon" },
    WeatherPreset { internal: "MidRainyNoon", display: "Mid Rainy Noon" },
    WeatherPreset { internal: "HardRainNoon", display: "Hard Rain Noon" },
    WeatherPreset { internal: "SoftRainNoon", display: "Soft Rain Noon" },
    WeatherPreset { internal: "ClearSunset", display: "Clear Sunset" },
    WeatherPreset { internal: "CloudySunset", display: "Cloudy Sunset" },
    WeatherPreset { internal: "WetSunset", display: "Wet Sunset" },
    WeatherPreset { internal: "WetCloudySunset", display: "Wet Cloudy Sunset" },
    WeatherPreset { internal: "MidRainSunset", display: "Mid Rain Sunset" },
    WeatherPreset { internal: "HardRainSunset", display: "Hard Rain Sunset" },
    WeatherPreset { internal: "SoftRainSunset", display: "Soft Rain Sunset" },
];

/// Matches either the internal or the display name, ignoring case.
pub fn lookup(name: &str) -> Option<&'static WeatherPreset> {
    let name = name.trim();
    PRESETS.iter().find(|p| {
        p.internal.eq_ignore_ascii_case(name) || p.display.eq_ignore_ascii_case(name)
    })
}

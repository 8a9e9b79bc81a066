/// Environment assignments the unit-file generator emits on every install.
///
/// This table is the single source of truth for "is this assignment custom":
/// the generator renders these lines and the customization diff compares
/// against them, so a changed default updates both sides at once.
pub const GENERATOR_ENVIRONMENT_DEFAULTS: &[(&str, &str)] = &[
    ("FIELDCAST_HOME", "/home/fieldcast"),
    ("FIELDCAST_AUDIO_DEVICE", "default"),
    ("FIELDCAST_SAMPLE_RATE", "48000"),
    ("FIELDCAST_CHANNELS", "2"),
    ("FIELDCAST_STREAM_PORT", "8000"),
    ("FIELDCAST_RECORDING_DIR", "/var/lib/fieldcast/recordings"),
    ("FIELDCAST_LOG_LEVEL", "info"),
];

pub fn generator_default(key: &str) -> Option<&'static str> {
    GENERATOR_ENVIRONMENT_DEFAULTS
        .iter()
        .find(|(default_key, _)| *default_key == key)
        .map(|(_, value)| *value)
}

/// An assignment is a generator default only when both the key and the value
/// match; a known key with an operator-changed value counts as custom.
pub fn is_generator_default(key: &str, value: &str) -> bool {
    generator_default(key) == Some(value)
}

// options.rs — Generator configuration knobs
//
// Read once at the start of a request and held fixed until it completes.
//
// Preconditions: none.
// Postconditions: `from_env` never fails; bad values keep the default.
// Failure modes: none (unparsable overrides are logged).
// Side effects: `from_env` reads process environment variables.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const ENV_SOA: &str = "MARAWACC_SOA";
pub const ENV_GUARDS: &str = "MARAWACC_GUARDS";
pub const ENV_COMMENTS: &str = "MARAWACC_DEBUG_KERNEL";
pub const ENV_DEVICES: &str = "MARAWACC_DEVICES";
pub const ENV_PRINT_KERNEL: &str = "MARAWACC_PRINT_KERNEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Expand tuple arrays into one buffer per field.
    pub soa: bool,
    /// Emit deoptimization guards and the shared `deoptFlag` buffer.
    pub deopt_guards: bool,
    /// Emit `/* visited ... */` comments into the kernel text.
    pub comments: bool,
    /// Number of devices the input is sharded across.
    pub devices: usize,
    /// Log the final translation unit at debug level.
    pub print_kernel: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        GeneratorOptions {
            soa: true,
            deopt_guards: true,
            comments: false,
            devices: 1,
            print_kernel: false,
        }
    }
}

impl GeneratorOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = GeneratorOptions::default();
        override_bool(&lookup, ENV_SOA, &mut opts.soa);
        override_bool(&lookup, ENV_GUARDS, &mut opts.deopt_guards);
        override_bool(&lookup, ENV_COMMENTS, &mut opts.comments);
        override_bool(&lookup, ENV_PRINT_KERNEL, &mut opts.print_kernel);
        if let Some(raw) = lookup(ENV_DEVICES) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => opts.devices = n,
                _ => warn!(var = ENV_DEVICES, value = %raw, "ignoring invalid device count"),
            }
        }
        opts
    }
}

fn override_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse_bool(&raw) {
        Some(v) => *slot = v,
        None => warn!(var = key, value = %raw, "ignoring invalid boolean"),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

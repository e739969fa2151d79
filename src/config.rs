//! Debug-flag configuration
//!
//! Runtime overrides for command-buffer and heap sizing, reuse-pool
//! prefilling and fence handling. Flags can be set programmatically,
//! loaded from a JSON file, or picked up from `CMDFORGE_*` environment
//! variables, mirroring how driver debug variables are consumed.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CmdForgeError, CmdResult};

const OVERRIDE_CMD_BUFFER_SIZE_ENV: &str = "CMDFORGE_OVERRIDE_CMD_BUFFER_SIZE_KB";
const FORCE_DEFAULT_HEAP_SIZE_ENV: &str = "CMDFORGE_FORCE_DEFAULT_HEAP_SIZE_KB";
const REUSABLE_ALLOCATION_COUNT_ENV: &str = "CMDFORGE_REUSABLE_ALLOCATION_COUNT";
const REMOVE_USER_FENCE_ENV: &str = "CMDFORGE_REMOVE_USER_FENCE_ON_RESET";
const USE_BINDLESS_MODE_ENV: &str = "CMDFORGE_USE_BINDLESS_MODE";

/// Runtime debug flags affecting container behavior
///
/// All flags default to "no override". Sizing flags are expressed in
/// kilobytes to match the values accepted by the environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    /// Override the default command-buffer payload size (KiB, 0 = off)
    pub override_cmd_buffer_size_kb: Option<usize>,
    /// Override the default indirect-heap size (KiB, 0 = off)
    pub force_default_heap_size_kb: Option<usize>,
    /// Number of command buffers (and heap spares) to prefill per
    /// immediate reuse list; 0 disables prefilling
    pub reusable_allocation_count: u32,
    /// Skip user-fence completion on reset and destroy
    pub remove_user_fence_on_reset_and_destroy: bool,
    /// Collapse surface/dynamic state into a single bindless heap spare
    /// when prefilling reuse lists
    pub use_bindless_mode: bool,
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self {
            override_cmd_buffer_size_kb: None,
            force_default_heap_size_kb: None,
            reusable_allocation_count: 0,
            remove_user_fence_on_reset_and_destroy: true,
            use_bindless_mode: false,
        }
    }
}

impl DebugFlags {
    /// Create flags with every override disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command-buffer size override (KiB)
    pub fn with_cmd_buffer_size_kb(mut self, kb: usize) -> Self {
        self.override_cmd_buffer_size_kb = Some(kb);
        self
    }

    /// Set the default-heap size override (KiB)
    pub fn with_default_heap_size_kb(mut self, kb: usize) -> Self {
        self.force_default_heap_size_kb = Some(kb);
        self
    }

    /// Set the reuse-list prefill amount
    pub fn with_reusable_allocation_count(mut self, count: u32) -> Self {
        self.reusable_allocation_count = count;
        self
    }

    /// Enable or disable user-fence completion on reset/destroy
    pub fn with_remove_user_fence(mut self, remove: bool) -> Self {
        self.remove_user_fence_on_reset_and_destroy = remove;
        self
    }

    /// Enable bindless mode
    pub fn with_bindless_mode(mut self, bindless: bool) -> Self {
        self.use_bindless_mode = bindless;
        self
    }

    /// Load flags from `CMDFORGE_*` environment variables
    ///
    /// Unset variables keep their defaults; malformed values are
    /// rejected rather than silently ignored.
    pub fn from_env() -> CmdResult<Self> {
        let mut flags = Self::default();

        if let Some(kb) = parse_env_usize(OVERRIDE_CMD_BUFFER_SIZE_ENV)? {
            if kb > 0 {
                flags.override_cmd_buffer_size_kb = Some(kb);
            }
        }
        if let Some(kb) = parse_env_usize(FORCE_DEFAULT_HEAP_SIZE_ENV)? {
            if kb > 0 {
                flags.force_default_heap_size_kb = Some(kb);
            }
        }
        if let Some(count) = parse_env_usize(REUSABLE_ALLOCATION_COUNT_ENV)? {
            flags.reusable_allocation_count = count as u32;
        }
        if let Some(v) = parse_env_bool(REMOVE_USER_FENCE_ENV)? {
            flags.remove_user_fence_on_reset_and_destroy = v;
        }
        if let Some(v) = parse_env_bool(USE_BINDLESS_MODE_ENV)? {
            flags.use_bindless_mode = v;
        }

        Ok(flags)
    }

    /// Parse flags from a JSON string
    pub fn from_json_str(json: &str) -> CmdResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CmdForgeError::InvalidConfiguration(format!("debug flags: {}", e)))
    }

    /// Load flags from a JSON file
    pub fn from_json_file(path: &Path) -> CmdResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

fn parse_env_usize(name: &str) -> CmdResult<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| CmdForgeError::InvalidConfiguration(format!("{}={}", name, value))),
        Err(_) => Ok(None),
    }
}

fn parse_env_bool(name: &str) -> CmdResult<Option<bool>> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "on" => Ok(Some(true)),
            "0" | "false" | "off" => Ok(Some(false)),
            _ => Err(CmdForgeError::InvalidConfiguration(format!(
                "{}={}",
                name, value
            ))),
        },
        Err(_) => Ok(None),
    }
}
